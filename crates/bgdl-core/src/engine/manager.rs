//! Download Manager - the facade consumers talk to
//!
//! Coordinates the registry, the resume token store, the corrector and the
//! transport:
//! - start/pause/resume of transfers addressed by caller-assigned ids
//! - one spawned task per transfer, which owns its terminal path
//! - recovery of transfers interrupted by the end of an earlier process

use crate::corrector::{Correction, ResumeTokenCorrector};
use crate::engine::recovery::{self, tagged_url};
use crate::engine::{Registration, TransferRegistry};
use crate::error::BgdlError;
use crate::storage::ResumeTokenStore;
use crate::transport::{
    resume_data, DownloadRequest, DownloadSource, HttpTransport, ProgressCallback, Transport,
};
use bgdl_types::{ManagerConfig, StoredToken, TransferErrorKind, TransferEvent, TransferId};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

/// File name used when the URL path does not end in a usable segment
const FALLBACK_FILE_NAME: &str = "download";

/// Minimum spacing of progress events per transfer; the final tick always goes out
const PROGRESS_INTERVAL: Duration = Duration::from_millis(300);

/// Resumable background download manager
pub struct DownloadManager<T: Transport = HttpTransport> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    config: ManagerConfig,
    transport: T,
    store: ResumeTokenStore,
    registry: TransferRegistry,
    corrector: ResumeTokenCorrector,
    event_tx: broadcast::Sender<TransferEvent>,
    initialized: AtomicBool,
}

impl DownloadManager<HttpTransport> {
    /// Create a manager backed by the HTTP transport.
    ///
    /// Opens the transfer session named by `config.session_id`.
    pub async fn new(config: ManagerConfig) -> Result<Self, BgdlError> {
        let transport = HttpTransport::new(&config).await?;
        Self::with_transport(config, transport).await
    }
}

impl<T: Transport> DownloadManager<T> {
    /// Create a manager on top of any transport
    pub async fn with_transport(config: ManagerConfig, transport: T) -> Result<Self, BgdlError> {
        let store = ResumeTokenStore::new(config.token_dir.clone()).await?;
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        info!(
            "Download manager ready (session {}, tokens in {})",
            transport.session_id(),
            store.dir().display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                corrector: ResumeTokenCorrector::new(config.platform_version),
                config,
                transport,
                store,
                registry: TransferRegistry::new(),
                event_tx,
                initialized: AtomicBool::new(false),
            }),
        })
    }

    /// Subscribe to transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Recover transfers interrupted by the end of an earlier process.
    ///
    /// Runs once per manager. Returns the ids that were picked up again.
    pub async fn initialize(&self) -> Result<Vec<TransferId>, BgdlError> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Err(BgdlError::AlreadyInitialized);
        }

        let tasks = self.inner.transport.all_tasks().await?;
        info!(
            "Session {} reports {} task(s)",
            self.inner.transport.session_id(),
            tasks.len()
        );

        let mut recovered = Vec::new();
        for transfer in recovery::scan(tasks) {
            let id = transfer.id;

            if let Err(e) = self.inner.replace_token(id, &transfer.resume_data).await {
                error!("Failed to save resume token of interrupted transfer {}: {}", id, e);
                self.inner.emit(TransferEvent::Error {
                    id: Some(id),
                    kind: TransferErrorKind::Storage,
                    message: e.to_string(),
                });
                continue;
            }

            info!("Found interrupted transfer {}: {}", id, transfer.url);
            self.inner.emit(TransferEvent::PreviousDownloadDetected { id });

            match self.resume(id, transfer.url.as_str()).await {
                Ok(()) => recovered.push(id),
                Err(e) => warn!("Failed to resume interrupted transfer {}: {}", id, e),
            }
        }

        Ok(recovered)
    }

    /// Start downloading `url` as transfer `id`.
    ///
    /// The file lands in the destination directory under the last path
    /// segment of the URL, replacing any file already there. A transfer
    /// already active under `id` is cancelled and replaced.
    pub fn start(&self, id: TransferId, url: &str) -> Result<(), BgdlError> {
        let url = parse_url(url)?;

        info!("Starting transfer {}: {}", id, url);
        self.spawn(
            id,
            DownloadRequest {
                source: DownloadSource::Url(tagged_url(&url, id)),
                destination: self.destination_for(&url),
            },
        );
        Ok(())
    }

    /// Pause transfer `id`.
    ///
    /// Returns false if it is not active. The `Paused` event follows once
    /// the transport has handed over its resume data.
    pub fn pause(&self, id: TransferId) -> bool {
        match self.inner.registry.cancel_and_remove(id) {
            Some(snapshot) => {
                info!(
                    "Pausing transfer {} at {:.1}%{}",
                    id,
                    snapshot.progress * 100.0,
                    if snapshot.terminal { " (body already received)" } else { "" }
                );
                true
            }
            None => {
                debug!("Transfer {} is not active, nothing to pause", id);
                false
            }
        }
    }

    /// Resume transfer `id` from its stored token, or start it over when
    /// there is no usable token.
    pub async fn resume(&self, id: TransferId, url: &str) -> Result<(), BgdlError> {
        let parsed = parse_url(url)?;

        let token = match self.inner.store.load(id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("No resume token for transfer {}, starting over", id);
                return self.start(id, url);
            }
            Err(e) => {
                warn!("Failed to read resume token of transfer {} ({}), starting over", id, e);
                return self.start(id, url);
            }
        };

        let token = match self.inner.corrector.correct(&token) {
            Correction::Corrected(bytes) => {
                debug!("Corrected resume token of transfer {}", id);
                bytes
            }
            Correction::Unmodified(bytes) => bytes,
            Correction::Unrecoverable(reason) => {
                warn!(
                    "Resume token of transfer {} is unusable ({}), starting over",
                    id, reason
                );
                self.inner.transport.discard(&token).await;
                return self.start(id, url);
            }
        };

        info!("Resuming transfer {}: {}", id, parsed);
        self.spawn(
            id,
            DownloadRequest {
                source: DownloadSource::ResumeData(token),
                destination: self.destination_for(&parsed),
            },
        );
        Ok(())
    }

    /// Whether a transfer is running under `id`
    pub fn is_active(&self, id: TransferId) -> bool {
        self.inner.registry.contains(id)
    }

    /// Whether `id` can be resumed: a token exists and nothing is running
    pub async fn is_resumable(&self, id: TransferId) -> bool {
        !self.is_active(id) && self.inner.store.exists(id).await
    }

    /// Last reported progress of an active transfer
    pub fn progress(&self, id: TransferId) -> Option<f64> {
        self.inner.registry.snapshot(id).map(|s| s.progress)
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn active_transfers(&self) -> Vec<TransferId> {
        let mut ids = self.inner.registry.ids();
        ids.sort_unstable();
        ids
    }

    /// Summaries of all stored resume tokens
    pub async fn stored_tokens(&self) -> Result<Vec<StoredToken>, BgdlError> {
        let mut tokens = Vec::new();
        for id in self.inner.store.list().await? {
            let Some(blob) = self.inner.store.load(id).await? else {
                continue;
            };
            let (url, bytes_received) = resume_data::inspect(&blob).unwrap_or((None, None));
            tokens.push(StoredToken {
                id,
                url,
                bytes_received,
                size_on_disk: blob.len() as u64,
            });
        }
        Ok(tokens)
    }

    /// Forget the stored token of `id` and the partial file behind it; the
    /// next resume starts over.
    ///
    /// The partial file of a transfer that is still running is left alone.
    pub async fn discard_token(&self, id: TransferId) -> Result<(), BgdlError> {
        let old = self.inner.load_token_quietly(id).await;
        self.inner.store.delete(id).await?;
        if let Some(old) = old {
            if !self.is_active(id) {
                self.inner.transport.discard(&old).await;
            }
        }
        info!("Discarded resume token of transfer {}", id);
        Ok(())
    }

    fn destination_for(&self, url: &Url) -> PathBuf {
        self.inner.config.destination_dir.join(file_name_for(url))
    }

    fn spawn(&self, id: TransferId, request: DownloadRequest) {
        let registration = self.inner.registry.register(id);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_transfer(id, registration, request).await;
        });
    }
}

impl<T: Transport> Inner<T> {
    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Stored token of `id`, treating an unreadable one as absent
    async fn load_token_quietly(&self, id: TransferId) -> Option<Vec<u8>> {
        match self.store.load(id).await {
            Ok(token) => token,
            Err(e) => {
                debug!("Ignoring unreadable resume token of transfer {}: {}", id, e);
                None
            }
        }
    }

    /// Save `token` for `id`. A previous token that referred to a
    /// different partial file is superseded, so that file goes too.
    async fn replace_token(&self, id: TransferId, token: &[u8]) -> Result<(), BgdlError> {
        let old = self.load_token_quietly(id).await;
        self.store.save(id, token).await?;

        if let Some(old) = old {
            let old_file = resume_data::temp_file_name(&old);
            if old_file.is_some() && old_file != resume_data::temp_file_name(token) {
                debug!("Resume token of transfer {} superseded", id);
                self.transport.discard(&old).await;
            }
        }
        Ok(())
    }

    /// Delete the token of a finished transfer along with its partial file
    async fn remove_token(&self, id: TransferId) -> Result<(), BgdlError> {
        let old = self.load_token_quietly(id).await;
        self.store.delete(id).await?;
        if let Some(old) = old {
            self.transport.discard(&old).await;
        }
        Ok(())
    }

    /// Drive one transfer to its end and report the outcome
    async fn run_transfer(
        self: Arc<Self>,
        id: TransferId,
        registration: Registration,
        request: DownloadRequest,
    ) {
        let progress: ProgressCallback = {
            let inner = self.clone();
            let generation = registration.generation;
            let last_emit: Mutex<Option<Instant>> = Mutex::new(None);
            Box::new(move |fraction| {
                inner.registry.set_progress(id, generation, fraction);

                let now = Instant::now();
                let due = {
                    let mut last = last_emit.lock();
                    let due = fraction >= 1.0
                        || last.map_or(true, |at| now.duration_since(at) >= PROGRESS_INTERVAL);
                    if due {
                        *last = Some(now);
                    }
                    due
                };
                if due {
                    inner.emit(TransferEvent::Progress { id, fraction });
                }
            })
        };

        let result = self
            .transport
            .download(request, progress, registration.cancel.clone())
            .await;
        if let Some(snapshot) = self.registry.finish(id, registration.generation) {
            debug!(
                "Transfer {} ran for {:.1}s",
                id,
                snapshot.elapsed.as_secs_f64()
            );
        }

        match result {
            Ok(path) => {
                if let Err(e) = self.remove_token(id).await {
                    error!("Failed to delete resume token of transfer {}: {}", id, e);
                    self.emit(TransferEvent::Error {
                        id: None,
                        kind: TransferErrorKind::Storage,
                        message: format!("stale resume token for transfer {}: {}", id, e),
                    });
                }
                info!("Transfer {} completed: {}", id, path.display());
                self.emit(TransferEvent::Completed { id });
            }
            Err(e) => match e.resume_data {
                Some(payload) => self.capture(id, payload).await,
                None => {
                    warn!("Transfer {} failed: {}", id, e.message);
                    self.emit(TransferEvent::Error {
                        id: Some(id),
                        kind: TransferErrorKind::Transfer,
                        message: e.message,
                    });
                }
            },
        }
    }

    /// Persist the resume payload of an interrupted transfer
    async fn capture(&self, id: TransferId, payload: Vec<u8>) {
        let token = match self.corrector.correct(&payload) {
            Correction::Corrected(bytes) => {
                debug!("Corrected resume token of transfer {}", id);
                bytes
            }
            Correction::Unmodified(bytes) => bytes,
            Correction::Unrecoverable(reason) => {
                warn!(
                    "Resume token of transfer {} could not be corrected ({}), saving it as is",
                    id, reason
                );
                payload
            }
        };

        match self.replace_token(id, &token).await {
            Ok(()) => {
                info!("Transfer {} paused, resume token saved", id);
                self.emit(TransferEvent::Paused { id });
            }
            Err(e) => {
                error!("Failed to save resume token of transfer {}: {}", id, e);
                self.emit(TransferEvent::Error {
                    id: Some(id),
                    kind: TransferErrorKind::Storage,
                    message: e.to_string(),
                });
            }
        }
    }
}

impl<T: Transport> Clone for DownloadManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn parse_url(url: &str) -> Result<Url, BgdlError> {
    let parsed = Url::parse(url).map_err(|_| BgdlError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(BgdlError::InvalidUrl(url.to_string())),
    }
}

/// Percent-decoded last path segment of `url`
fn file_name_for(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|name| name.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .filter(|name| !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\']))
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}
