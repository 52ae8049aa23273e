//! Recovery of transfers left behind by an earlier process
//!
//! Every request carries its transfer id in a `tag` query parameter. That is
//! the only link between a task the session reports at start-up and the
//! transfer it belonged to.

use crate::transport::TaskSnapshot;
use bgdl_types::TransferId;
use tracing::debug;
use url::Url;

/// Query parameter carrying the transfer id
pub const TAG_PARAM: &str = "tag";

/// An interrupted transfer that can be picked up again
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredTransfer {
    pub id: TransferId,
    /// Original URL with the `tag` parameter removed
    pub url: Url,
    /// Resume payload exactly as the transport produced it
    pub resume_data: Vec<u8>,
}

/// Transfer id carried by `url`, if it has a parsable `tag` parameter
pub fn transfer_id_from_url(url: &Url) -> Option<TransferId> {
    url.query_pairs()
        .find(|(key, _)| key == TAG_PARAM)
        .and_then(|(_, value)| value.parse().ok())
}

/// `url` without any `tag` parameter; other parameters are kept in order
pub fn strip_tag(url: &Url) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != TAG_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    stripped
}

/// `url` addressed to transfer `id`, replacing any previous tag
pub fn tagged_url(url: &Url, id: TransferId) -> Url {
    let mut tagged = strip_tag(url);
    tagged
        .query_pairs_mut()
        .append_pair(TAG_PARAM, &id.to_string());
    tagged
}

/// Pick the tasks worth recovering.
///
/// A task qualifies when it ended with a cancellation, left resume data
/// and its URL names a transfer. Anything else is skipped.
pub fn scan(tasks: Vec<TaskSnapshot>) -> Vec<RecoveredTransfer> {
    tasks
        .into_iter()
        .filter_map(|task| {
            let Some(error) = task.error else {
                debug!("Task {} is still running, leaving it alone", task.task_id);
                return None;
            };
            if !error.is_cancellation() {
                debug!("Task {} failed ({}), not recoverable", task.task_id, error);
                return None;
            }
            let Some(resume_data) = error.resume_data else {
                debug!("Task {} left no resume data", task.task_id);
                return None;
            };
            let Some(url) = task.original_url else {
                debug!("Task {} has no original request", task.task_id);
                return None;
            };
            let Some(id) = transfer_id_from_url(&url) else {
                debug!("Task {} is not tagged with a transfer id: {}", task.task_id, url);
                return None;
            };

            Some(RecoveredTransfer {
                id,
                url: strip_tag(&url),
                resume_data,
            })
        })
        .collect()
}
