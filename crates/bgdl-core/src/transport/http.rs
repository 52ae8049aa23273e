//! reqwest-backed transport with a persistent session directory
//!
//! Each task streams into a partial file inside the session directory and is
//! journaled while it runs. The partial file is moved into place when the
//! body is complete.

use super::{
    resume_data, DownloadRequest, DownloadSource, ProgressCallback, ResumeData, TaskError, TaskErrorKind,
    TaskJournal, TaskRecord, TaskSnapshot, Transport,
};
use crate::error::BgdlError;
use bgdl_types::ManagerConfig;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{header, Client, StatusCode};
use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often the journal row of a running task is refreshed
const JOURNAL_INTERVAL: Duration = Duration::from_secs(2);

/// HTTP transport bound to one session identifier
pub struct HttpTransport {
    session_id: String,
    /// Partial files and the task journal
    session_dir: PathBuf,
    client: Client,
    journal: TaskJournal,
    /// Tasks running in this process
    live: Mutex<HashSet<Uuid>>,
}

impl HttpTransport {
    /// Open the session named by `config.session_id`
    pub async fn new(config: &ManagerConfig) -> Result<Self, BgdlError> {
        let session_dir = config.session_dir.join(&config.session_id);
        fs::create_dir_all(&session_dir).await?;

        let journal = TaskJournal::new(session_dir.join("tasks.db")).await?;

        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        info!(
            "Opened transfer session {} at {}",
            config.session_id,
            session_dir.display()
        );

        Ok(Self {
            session_id: config.session_id.clone(),
            session_dir,
            client,
            journal,
            live: Mutex::new(HashSet::new()),
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn partial_path(&self, record: &TaskRecord) -> PathBuf {
        self.session_dir.join(&record.partial_file)
    }

    async fn remove_partial(&self, name: &str) {
        match fs::remove_file(self.session_dir.join(name)).await {
            Ok(()) => debug!("Removed partial file {}", name),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial file {}: {}", name, e),
        }
    }

    fn resume_data_for(&self, record: &TaskRecord) -> Option<Vec<u8>> {
        let data = ResumeData {
            url: record.url.clone(),
            bytes_received: record.bytes_received,
            temp_file_name: record.partial_file.clone(),
            entity_tag: record.entity_tag.clone(),
            last_modified: record.last_modified.clone(),
        };
        match data.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode resume data for task {}: {}", record.task_id, e);
                None
            }
        }
    }

    /// Build the error a task ends with when it stops part-way.
    ///
    /// Cancelled tasks always carry resume data; dropped connections do
    /// once some bytes made it to disk.
    fn interrupt(&self, record: &TaskRecord, kind: TaskErrorKind, message: impl Into<String>) -> TaskError {
        let resumable = match kind {
            TaskErrorKind::Cancelled => true,
            TaskErrorKind::Network => record.bytes_received > 0,
            _ => false,
        };
        let resume_data = if resumable {
            self.resume_data_for(record)
        } else {
            None
        };
        TaskError::new(kind, message).with_resume_data(resume_data)
    }

    async fn prepare(&self, request: &DownloadRequest) -> Result<TaskRecord, TaskError> {
        match &request.source {
            DownloadSource::Url(url) => Ok(TaskRecord::new(url.clone(), request.destination.clone())),
            DownloadSource::ResumeData(bytes) => {
                let data = ResumeData::decode(bytes)?;

                let mut record = TaskRecord::new(data.url, request.destination.clone());
                record.partial_file = data.temp_file_name;
                record.bytes_received = data.bytes_received;
                record.entity_tag = data.entity_tag;
                record.last_modified = data.last_modified;

                let partial = self.partial_path(&record);
                if !fs::try_exists(&partial).await.unwrap_or(false) {
                    return Err(TaskError::new(
                        TaskErrorKind::InvalidResumeData,
                        format!("partial file {} is gone", record.partial_file),
                    ));
                }
                Ok(record)
            }
        }
    }

    async fn run(
        &self,
        record: &mut TaskRecord,
        progress: &ProgressCallback,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        let partial = self.partial_path(record);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&partial)
            .await?;

        // Never trust the recorded offset beyond what is actually on disk
        let existing = file.metadata().await?.len();
        let offset = record.bytes_received.min(existing);
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        record.bytes_received = offset;

        self.journal.upsert(record).await?;

        let mut request = self.client.get(record.url.as_str());
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
            if let Some(validator) = record.entity_tag.as_ref().or(record.last_modified.as_ref()) {
                request = request.header(header::IF_RANGE, validator.as_str());
            }
            debug!("Task {} requesting bytes {}-", record.task_id, offset);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(self.interrupt(record, TaskErrorKind::Cancelled, "cancelled"));
            }
            response = request.send() => match response {
                Ok(response) => response,
                Err(e) => return Err(self.interrupt(record, TaskErrorKind::Network, e.to_string())),
            },
        };

        let status = response.status();
        if status == StatusCode::PARTIAL_CONTENT && offset > 0 {
            info!("Task {} resuming at byte {}", record.task_id, offset);
        } else if status.is_success() {
            if offset > 0 {
                info!(
                    "Server ignored the range for {}, restarting task {} from zero",
                    record.url, record.task_id
                );
                file.set_len(0).await?;
                file.seek(SeekFrom::Start(0)).await?;
                record.bytes_received = 0;
            }
        } else {
            return Err(TaskError::new(
                TaskErrorKind::Server(status.as_u16()),
                format!("server returned {} for {}", status, record.url),
            ));
        }

        let headers = response.headers();
        if let Some(tag) = headers.get(header::ETAG).and_then(|v| v.to_str().ok()) {
            record.entity_tag = Some(tag.to_string());
        }
        if let Some(date) = headers.get(header::LAST_MODIFIED).and_then(|v| v.to_str().ok()) {
            record.last_modified = Some(date.to_string());
        }
        record.total_bytes = content_range_total(headers)
            .or_else(|| response.content_length().map(|len| len + record.bytes_received));

        let report = |received: u64, total: Option<u64>| match total {
            Some(total) if total > 0 => progress((received as f64 / total as f64).min(1.0)),
            _ => progress(0.0),
        };
        report(record.bytes_received, record.total_bytes);

        let mut stream = response.bytes_stream();
        let mut last_journal = tokio::time::Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    info!("Task {} cancelled at byte {}", record.task_id, record.bytes_received);
                    return Err(self.interrupt(record, TaskErrorKind::Cancelled, "cancelled"));
                }
                next = stream.next() => next,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    file.flush().await?;
                    warn!("Task {} lost its connection: {}", record.task_id, e);
                    return Err(self.interrupt(record, TaskErrorKind::Network, e.to_string()));
                }
            };

            file.write_all(&chunk).await?;
            record.bytes_received += chunk.len() as u64;
            report(record.bytes_received, record.total_bytes);

            if last_journal.elapsed() >= JOURNAL_INTERVAL {
                file.flush().await?;
                if let Err(e) = self
                    .journal
                    .update_progress(record.task_id, record.bytes_received)
                    .await
                {
                    warn!("Failed to journal progress of task {}: {}", record.task_id, e);
                }
                last_journal = tokio::time::Instant::now();
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(total) = record.total_bytes {
            if record.bytes_received < total {
                return Err(self.interrupt(
                    record,
                    TaskErrorKind::Network,
                    format!(
                        "connection closed after {} of {} bytes",
                        record.bytes_received, total
                    ),
                ));
            }
        }

        self.finalize(record).await
    }

    /// Move the finished partial file to its destination, replacing any file there
    async fn finalize(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let partial = self.partial_path(record);

        if let Some(parent) = record.destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::remove_file(&record.destination).await {
            Ok(()) => debug!("Replaced existing {}", record.destination.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = fs::rename(&partial, &record.destination).await {
            debug!("Rename failed ({}), copying {} instead", e, partial.display());
            fs::copy(&partial, &record.destination).await?;
            fs::remove_file(&partial).await?;
        }

        info!(
            "Task {} complete: {} ({} bytes)",
            record.task_id,
            record.destination.display(),
            record.bytes_received
        );
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn all_tasks(&self) -> Result<Vec<TaskSnapshot>, BgdlError> {
        let records = self.journal.load_all().await?;
        let mut tasks = Vec::with_capacity(records.len());

        for mut record in records {
            if self.live.lock().contains(&record.task_id) {
                tasks.push(TaskSnapshot {
                    task_id: record.task_id.to_string(),
                    original_url: Some(record.url.clone()),
                    error: None,
                });
                continue;
            }

            // The process that ran this task is gone. What is on disk is
            // what it managed to write.
            let resume_data = match fs::metadata(self.partial_path(&record)).await {
                Ok(meta) => {
                    record.bytes_received = meta.len();
                    self.resume_data_for(&record)
                }
                Err(_) => {
                    warn!("Orphaned task {} has no partial file", record.task_id);
                    None
                }
            };
            info!(
                "Found orphaned task {} for {} ({} bytes on disk)",
                record.task_id, record.url, record.bytes_received
            );

            if let Err(e) = self.journal.delete(record.task_id).await {
                warn!("Failed to drop orphaned task {}: {}", record.task_id, e);
            }

            tasks.push(TaskSnapshot {
                task_id: record.task_id.to_string(),
                original_url: Some(record.url),
                error: Some(TaskError::cancelled(resume_data)),
            });
        }

        Ok(tasks)
    }

    async fn download(
        &self,
        request: DownloadRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<PathBuf, TaskError> {
        let mut record = self.prepare(&request).await?;

        self.live.lock().insert(record.task_id);
        info!(
            "Task {} started for {} at byte {}",
            record.task_id, record.url, record.bytes_received
        );

        let result = self.run(&mut record, &progress, &cancel).await;

        self.live.lock().remove(&record.task_id);
        if let Err(e) = self.journal.delete(record.task_id).await {
            warn!("Failed to drop task {} from the journal: {}", record.task_id, e);
        }

        // A fresh task that cannot continue leaves nothing worth keeping.
        // A resumed one still belongs to the token it came from.
        if let Err(e) = &result {
            if e.resume_data.is_none() && matches!(request.source, DownloadSource::Url(_)) {
                self.remove_partial(&record.partial_file).await;
            }
        }

        result.map(|()| record.destination)
    }

    async fn discard(&self, resume_data: &[u8]) {
        match resume_data::temp_file_name(resume_data) {
            Some(name) => self.remove_partial(&name).await,
            None => debug!("Discarded resume data names no partial file"),
        }
    }
}

/// Total size from a `Content-Range: bytes a-b/total` header
fn content_range_total(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()
        .filter(|total| *total != "*")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::Notify;
    use url::Url;

    /// Minimal HTTP/1.1 server: honours `Range: bytes=N-`; without a range
    /// it sends half the body and then stalls.
    async fn serve(body: Vec<u8>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&buf).to_lowercase();
                    let start = request
                        .lines()
                        .find_map(|l| l.strip_prefix("range: bytes="))
                        .and_then(|r| r.trim_end_matches('-').trim().parse::<usize>().ok());

                    match start {
                        Some(start) => {
                            let rest = &body[start..];
                            let head = format!(
                                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nETag: \"v1\"\r\nConnection: close\r\n\r\n",
                                rest.len(),
                                start,
                                body.len() - 1,
                                body.len()
                            );
                            let _ = socket.write_all(head.as_bytes()).await;
                            let _ = socket.write_all(rest).await;
                        }
                        None => {
                            let head = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nETag: \"v1\"\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                                body.len()
                            );
                            let _ = socket.write_all(head.as_bytes()).await;
                            let _ = socket.write_all(&body[..body.len() / 2]).await;
                            let _ = socket.flush().await;
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                });
            }
        });

        Url::parse(&format!("http://{}/files/data.bin?tag=1", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_cancel_then_resume_from_offset() {
        let temp = TempDir::new().unwrap();
        let config = ManagerConfig::with_root(temp.path()).session("http-test");
        let transport = Arc::new(HttpTransport::new(&config).await.unwrap());

        let body: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
        let url = serve(body.clone()).await;
        let destination = temp.path().join("out/data.bin");

        let halfway = Arc::new(Notify::new());
        let signal = halfway.clone();
        let cancel = CancellationToken::new();
        let task = {
            let transport = transport.clone();
            let cancel = cancel.clone();
            let request = DownloadRequest {
                source: DownloadSource::Url(url),
                destination: destination.clone(),
            };
            tokio::spawn(async move {
                let progress: ProgressCallback = Box::new(move |fraction| {
                    if fraction >= 0.5 {
                        signal.notify_one();
                    }
                });
                transport.download(request, progress, cancel).await
            })
        };

        halfway.notified().await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());

        let resume = ResumeData::decode(err.resume_data.as_ref().unwrap()).unwrap();
        assert_eq!(resume.bytes_received, body.len() as u64 / 2);
        assert_eq!(resume.entity_tag.as_deref(), Some("\"v1\""));

        let path = transport
            .download(
                DownloadRequest {
                    source: DownloadSource::ResumeData(err.resume_data.unwrap()),
                    destination: destination.clone(),
                },
                Box::new(|_| {}),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(path, destination);
        assert_eq!(fs::read(&destination).await.unwrap(), body);
        assert!(transport.all_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_task_reported_once() {
        let temp = TempDir::new().unwrap();
        let config = ManagerConfig::with_root(temp.path());
        let record = TaskRecord::new(
            Url::parse("http://host/a/b.iso?tag=7").unwrap(),
            temp.path().join("b.iso"),
        );

        {
            let transport = HttpTransport::new(&config).await.unwrap();
            transport.journal.upsert(&record).await.unwrap();
            fs::write(transport.partial_path(&record), vec![0u8; 300])
                .await
                .unwrap();
        }

        // next process lifetime, same session identifier
        let transport = HttpTransport::new(&config).await.unwrap();
        let tasks = transport.all_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].original_url.as_ref(), Some(&record.url));

        let error = tasks[0].error.as_ref().unwrap();
        assert!(error.is_cancellation());
        let resume = ResumeData::decode(error.resume_data.as_ref().unwrap()).unwrap();
        assert_eq!(resume.bytes_received, 300);
        assert_eq!(resume.temp_file_name, record.partial_file);

        assert!(transport.all_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_without_partial_file_is_rejected() {
        let temp = TempDir::new().unwrap();
        let transport = HttpTransport::new(&ManagerConfig::with_root(temp.path()))
            .await
            .unwrap();
        let data = ResumeData {
            url: Url::parse("http://127.0.0.1:9/x.bin?tag=2").unwrap(),
            bytes_received: 10,
            temp_file_name: "missing.part".to_string(),
            entity_tag: None,
            last_modified: None,
        };

        let err = transport
            .download(
                DownloadRequest {
                    source: DownloadSource::ResumeData(data.encode().unwrap()),
                    destination: temp.path().join("x.bin"),
                },
                Box::new(|_| {}),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::InvalidResumeData);
        assert!(err.resume_data.is_none());
    }

    /// Server that answers every request with 404
    async fn serve_not_found() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut chunk = [0u8; 1024];
                let _ = socket.read(&mut chunk).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });
        Url::parse(&format!("http://{}/gone.bin?tag=4", addr)).unwrap()
    }

    async fn partial_files(transport: &HttpTransport) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(transport.session_dir()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.path().extension().is_some_and(|ext| ext == "part") {
                found.push(entry.path());
            }
        }
        found
    }

    #[tokio::test]
    async fn test_failed_fresh_task_leaves_no_partial_file() {
        let temp = TempDir::new().unwrap();
        let transport = HttpTransport::new(&ManagerConfig::with_root(temp.path()))
            .await
            .unwrap();

        let err = transport
            .download(
                DownloadRequest {
                    source: DownloadSource::Url(serve_not_found().await),
                    destination: temp.path().join("gone.bin"),
                },
                Box::new(|_| {}),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, TaskErrorKind::Server(404));
        assert!(err.resume_data.is_none());
        assert!(partial_files(&transport).await.is_empty());
    }

    #[tokio::test]
    async fn test_discard_removes_partial_file() {
        let temp = TempDir::new().unwrap();
        let transport = HttpTransport::new(&ManagerConfig::with_root(temp.path()))
            .await
            .unwrap();
        let record = TaskRecord::new(
            Url::parse("http://host/c.bin?tag=5").unwrap(),
            temp.path().join("c.bin"),
        );
        fs::write(transport.partial_path(&record), b"partial").await.unwrap();

        let token = transport.resume_data_for(&record).unwrap();
        transport.discard(&token).await;
        assert!(partial_files(&transport).await.is_empty());

        // already gone, and tokens that name nothing
        transport.discard(&token).await;
        transport.discard(b"not a token").await;
    }

    #[test]
    fn test_content_range_total() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_RANGE, "bytes 100-199/200".parse().unwrap());
        assert_eq!(content_range_total(&headers), Some(200));
        headers.insert(header::CONTENT_RANGE, "bytes 0-9/*".parse().unwrap());
        assert_eq!(content_range_total(&headers), None);
    }
}
