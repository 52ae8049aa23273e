//! CLI command implementations

use crate::output::{format_bytes, print_output, truncate};
use crate::progress::TransferProgress;
use crate::{ConfigAction, OutputFormat};
use anyhow::{anyhow, bail, Result};
use bgdl_core::DownloadManager;
use bgdl_types::{ManagerConfig, TransferEvent, TransferId};
use console::style;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

// ============================================================================
// Transfer Commands
// ============================================================================

pub async fn get(
    manager: &DownloadManager,
    id: TransferId,
    url: &str,
    format: OutputFormat,
) -> Result<()> {
    let rx = manager.subscribe();
    let recovered = recover_interrupted(manager, format).await?;

    let (ids, needs_request) = watch_list(recovered, id);
    if needs_request {
        manager.start(id, url)?;
    } else {
        debug!("Transfer {} was picked up from the last run", id);
    }
    watch(manager, rx, ids, format).await
}

pub async fn resume(
    manager: &DownloadManager,
    id: TransferId,
    url: &str,
    format: OutputFormat,
) -> Result<()> {
    let rx = manager.subscribe();
    let recovered = recover_interrupted(manager, format).await?;

    let (ids, needs_request) = watch_list(recovered, id);
    if needs_request {
        if format == OutputFormat::Human && !manager.is_resumable(id).await {
            println!(
                "{} Nothing saved for transfer {}, starting over",
                style("·").dim(),
                id
            );
        }
        manager.resume(id, url).await?;
    } else {
        debug!("Transfer {} was picked up from the last run", id);
    }
    watch(manager, rx, ids, format).await
}

pub async fn recover(manager: &DownloadManager, format: OutputFormat) -> Result<()> {
    let rx = manager.subscribe();
    let ids = recover_interrupted(manager, format).await?;

    if ids.is_empty() {
        if format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&TransferSummary::default())?);
        } else {
            println!("{}", style("No interrupted transfers found").dim());
        }
        return Ok(());
    }
    watch(manager, rx, ids, format).await
}

/// Pick up transfers an earlier run left behind, before anything else
/// touches the session
async fn recover_interrupted(
    manager: &DownloadManager,
    format: OutputFormat,
) -> Result<Vec<TransferId>> {
    let ids = manager.initialize().await?;
    if format == OutputFormat::Human && !ids.is_empty() {
        println!(
            "{} Picking up {} interrupted transfer(s)",
            style("↻").cyan().bold(),
            ids.len()
        );
    }
    Ok(ids)
}

/// Transfers to follow when a command targets `id`, and whether `id`
/// still has to be requested. A recovered `id` is already running.
fn watch_list(mut recovered: Vec<TransferId>, id: TransferId) -> (Vec<TransferId>, bool) {
    let needs_request = !recovered.contains(&id);
    if needs_request {
        recovered.push(id);
    }
    (recovered, needs_request)
}

/// How the watched transfers ended
#[derive(Debug, Default, Serialize)]
struct TransferSummary {
    completed: Vec<TransferId>,
    paused: Vec<TransferId>,
    failed: Vec<TransferId>,
    /// Finished while their final event was lost to a lagging stream
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ended: Vec<TransferId>,
}

/// State of a transfer as seen from the manager, used when its events
/// were missed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Running,
    Resumable,
    Gone,
}

impl TransferSummary {
    /// Account for pending transfers that are no longer running
    fn settle(
        &mut self,
        pending: &mut HashSet<TransferId>,
        observed: impl IntoIterator<Item = (TransferId, Observed)>,
    ) {
        for (id, state) in observed {
            if state == Observed::Running || !pending.remove(&id) {
                continue;
            }
            match state {
                Observed::Resumable => self.paused.push(id),
                _ => self.ended.push(id),
            }
        }
    }
}

async fn observe(
    manager: &DownloadManager,
    ids: &HashSet<TransferId>,
) -> Vec<(TransferId, Observed)> {
    let mut observed = Vec::with_capacity(ids.len());
    for &id in ids {
        let state = if manager.is_active(id) {
            Observed::Running
        } else if manager.is_resumable(id).await {
            Observed::Resumable
        } else {
            Observed::Gone
        };
        observed.push((id, state));
    }
    observed
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = |ids: &[TransferId]| {
            ids.iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        if !self.completed.is_empty() {
            writeln!(f, "{} Completed: {}", style("✓").green().bold(), ids(&self.completed))?;
        }
        if !self.paused.is_empty() {
            writeln!(
                f,
                "{} Paused: {} (continue with `bgdl resume <id> <url>`)",
                style("⏸").yellow(),
                ids(&self.paused)
            )?;
        }
        if !self.failed.is_empty() {
            writeln!(f, "{} Failed: {}", style("✗").red().bold(), ids(&self.failed))?;
        }
        if !self.ended.is_empty() {
            writeln!(
                f,
                "{} Ended without a report: {} (see `bgdl tokens`)",
                style("·").dim(),
                ids(&self.ended)
            )?;
        }
        Ok(())
    }
}

/// Follow transfers until each has ended. Ctrl-C pauses whatever is
/// still running and waits for the pauses to land.
async fn watch(
    manager: &DownloadManager,
    mut rx: broadcast::Receiver<TransferEvent>,
    ids: Vec<TransferId>,
    format: OutputFormat,
) -> Result<()> {
    let mut progress = TransferProgress::new(format != OutputFormat::Json);
    for id in &ids {
        progress.add_transfer(*id);
    }

    let mut pending: HashSet<TransferId> = ids.into_iter().collect();
    let mut summary = TransferSummary::default();
    let mut interrupted = false;

    while !pending.is_empty() {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                for id in manager.active_transfers() {
                    manager.pause(id);
                }
            }
            event = rx.recv() => match event {
                Ok(event) => {
                    progress.handle_event(&event);
                    if format == OutputFormat::Json {
                        println!("{}", serde_json::to_string(&event)?);
                    }

                    let Some(id) = event.id() else {
                        if let TransferEvent::Error { message, .. } = &event {
                            eprintln!("{} {}", style("!").yellow().bold(), message);
                        }
                        continue;
                    };
                    if !event.is_terminal() || !pending.remove(&id) {
                        continue;
                    }
                    match event {
                        TransferEvent::Completed { .. } => summary.completed.push(id),
                        TransferEvent::Paused { .. } => summary.paused.push(id),
                        _ => summary.failed.push(id),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // A skipped terminal event would leave us waiting forever
                    warn!("Event stream lagged, skipped {} event(s)", skipped);
                    let observed = observe(manager, &pending).await;
                    summary.settle(&mut pending, observed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    progress.clear();
    print_output(&summary, format)?;

    if !summary.failed.is_empty() {
        bail!("{} transfer(s) failed", summary.failed.len());
    }
    Ok(())
}

// ============================================================================
// Token Commands
// ============================================================================

pub async fn list_tokens(manager: &DownloadManager, format: OutputFormat) -> Result<()> {
    let tokens = manager.stored_tokens().await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&tokens)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct TokenRow {
                id: TransferId,
                url: String,
                received: String,
                token_size: String,
            }

            let rows: Vec<TokenRow> = tokens
                .iter()
                .map(|t| TokenRow {
                    id: t.id,
                    url: truncate(t.url.as_deref().unwrap_or("?"), 50),
                    received: t
                        .bytes_received
                        .map(format_bytes)
                        .unwrap_or_else(|| "?".to_string()),
                    token_size: format_bytes(t.size_on_disk),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if tokens.is_empty() {
                println!("{}", style("No resume tokens stored").dim());
                return Ok(());
            }

            for token in &tokens {
                println!(
                    "{} {} {}",
                    style("⏸").yellow(),
                    style(format!("#{}", token.id)).bold(),
                    token.url.as_deref().unwrap_or("(unreadable token)")
                );
                if let Some(bytes) = token.bytes_received {
                    println!("    Received: {}", format_bytes(bytes));
                }
            }
            println!();
            println!("{} token(s) total", style(tokens.len()).bold());
        }
    }

    Ok(())
}

pub async fn discard(manager: &DownloadManager, id: TransferId, yes: bool) -> Result<()> {
    if !manager.is_resumable(id).await {
        println!("{}", style(format!("No resume token for transfer {}", id)).dim());
        return Ok(());
    }

    if !yes {
        use dialoguer::Confirm;

        let confirmed = Confirm::new()
            .with_prompt(format!("Discard the saved progress of transfer {}?", id))
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    manager.discard_token(id).await?;
    println!("{} Resume token discarded", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    data_dir: &Path,
    config: ManagerConfig,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            _ => {
                println!("{}", style("Configuration").bold().underlined());
                println!("  session_id:           {}", config.session_id);
                println!("  destination_dir:      {}", config.destination_dir.display());
                println!("  token_dir:            {}", config.token_dir.display());
                println!("  session_dir:          {}", config.session_dir.display());
                println!("  platform_version:     {}", config.platform_version);
                println!("  user_agent:           {}", config.user_agent);
                println!("  connect_timeout_secs: {}", config.connect_timeout_secs);
                println!("  event_capacity:       {}", config.event_capacity);
            }
        },

        ConfigAction::Path => {
            println!("{}", bgdl_core::config_path(data_dir).display());
        }

        ConfigAction::Set { key, value } => {
            let mut config = config;

            match key.as_str() {
                "session_id" => config.session_id = value,
                "destination_dir" => config.destination_dir = PathBuf::from(value),
                "token_dir" => config.token_dir = PathBuf::from(value),
                "session_dir" => config.session_dir = PathBuf::from(value),
                "platform_version" => config.platform_version = value.parse()?,
                "user_agent" => config.user_agent = value,
                "connect_timeout_secs" => config.connect_timeout_secs = value.parse()?,
                "event_capacity" => config.event_capacity = value.parse()?,
                _ => return Err(anyhow!("Unknown config key: {}", key)),
            }

            bgdl_core::save_config(data_dir, &config).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        ConfigAction::Reset => {
            use dialoguer::Confirm;

            let confirmed = Confirm::new()
                .with_prompt("Reset configuration to defaults?")
                .default(false)
                .interact()?;

            if confirmed {
                bgdl_core::save_config(data_dir, &ManagerConfig::with_root(data_dir)).await?;
                println!("{} Configuration reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_list() {
        assert_eq!(watch_list(vec![], 4), (vec![4], true));
        assert_eq!(watch_list(vec![2, 4], 4), (vec![2, 4], false));
        assert_eq!(watch_list(vec![2], 4), (vec![2, 4], true));
    }

    #[test]
    fn test_settle_after_lag() {
        let mut pending: HashSet<TransferId> = [1, 2, 3].into_iter().collect();
        let mut summary = TransferSummary::default();

        summary.settle(
            &mut pending,
            [
                (1, Observed::Running),
                (2, Observed::Resumable),
                (3, Observed::Gone),
                // not watched
                (9, Observed::Gone),
            ],
        );

        assert_eq!(pending, [1].into_iter().collect());
        assert_eq!(summary.paused, vec![2]);
        assert_eq!(summary.ended, vec![3]);
        assert!(summary.failed.is_empty());
    }
}
