use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use deaddrop_core::{
    DOWNLOAD_ERROR_MESSAGE, Direction, TransferState, UPLOAD_ERROR_MESSAGE, UploadReceipt,
    file_extension, mime_for_extension, progress_percent, resolve_download_filename,
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

use crate::{
    saver::PayloadSaver,
    transport::{ProgressTick, Transport, UploadRequest},
};

#[derive(Debug, Clone)]
pub struct SelectedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: &Path) -> io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = mime_for_extension(&file_extension(&name)).unwrap_or_default();
        Ok(Self::new(name, mime_type, bytes))
    }
}

/// Owns the upload and download lifecycles of one client session.
///
/// Each operation is tagged with a fresh attempt number. Snapshots are published
/// through `watch` channels and a snapshot from an older attempt is never allowed
/// to replace one from a newer attempt. A superseded operation also stops
/// waiting on its transport call, which drops (and so cancels) the request.
pub struct TransferController<T> {
    transport: T,
    saver: Arc<dyn PayloadSaver>,
    upload: watch::Sender<TransferState>,
    download: watch::Sender<TransferState>,
    attempts: AtomicU64,
}

impl<T: Transport> TransferController<T> {
    pub fn new(transport: T, saver: impl PayloadSaver + 'static) -> Self {
        let (upload, _) = watch::channel(TransferState::idle(Direction::Upload));
        let (download, _) = watch::channel(TransferState::idle(Direction::Download));
        Self {
            transport,
            saver: Arc::new(saver),
            upload,
            download,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn upload_state(&self) -> TransferState {
        self.upload.borrow().clone()
    }

    pub fn download_state(&self) -> TransferState {
        self.download.borrow().clone()
    }

    pub fn subscribe_upload(&self) -> watch::Receiver<TransferState> {
        self.upload.subscribe()
    }

    pub fn subscribe_download(&self) -> watch::Receiver<TransferState> {
        self.download.subscribe()
    }

    pub fn upload_updates(&self) -> WatchStream<TransferState> {
        WatchStream::new(self.upload.subscribe())
    }

    /// Uploads `file` and resolves to this attempt's terminal snapshot.
    ///
    /// Returns `None` when a newer upload was started before this one finished.
    pub async fn start_upload(&self, file: SelectedFile) -> Option<TransferState> {
        let attempt = self.next_attempt();
        let pending =
            TransferState::in_progress(Direction::Upload, attempt, file_extension(&file.name));
        publish(&self.upload, attempt, pending.clone());
        info!(
            attempt,
            file_name = %file.name,
            bytes = file.bytes.len(),
            "upload started"
        );

        let (progress, mut ticks) = mpsc::unbounded_channel::<ProgressTick>();
        let request = UploadRequest {
            file_name: file.name,
            mime_type: file.mime_type,
            body: file.bytes,
        };
        let call = self.transport.upload(request, progress);
        tokio::pin!(call);

        let mut watcher = self.upload.subscribe();
        let outcome = loop {
            tokio::select! {
                biased;
                Some(tick) = ticks.recv() => self.apply_tick(attempt, tick),
                outcome = &mut call => break outcome,
                Ok(()) = watcher.changed() => {
                    if watcher.borrow_and_update().attempt > attempt {
                        debug!(attempt, "upload superseded");
                        return None;
                    }
                }
            }
        };
        // Progress reported before completion must land before the terminal snapshot.
        while let Ok(tick) = ticks.try_recv() {
            self.apply_tick(attempt, tick);
        }

        let terminal = match outcome {
            Ok(reply) if reply.status == 200 => match UploadReceipt::parse(&reply.body) {
                Ok(receipt) if !receipt.id.is_empty() => {
                    info!(attempt, pickup_key = %receipt.id, "upload finished");
                    pending.succeeded(receipt.id)
                }
                Ok(_) => {
                    warn!(attempt, "upload response carried an empty id");
                    pending.failed(UPLOAD_ERROR_MESSAGE)
                }
                Err(err) => {
                    warn!(attempt, "malformed upload response: {}", err);
                    pending.failed(UPLOAD_ERROR_MESSAGE)
                }
            },
            Ok(reply) => {
                warn!(attempt, status = reply.status, "upload rejected");
                pending.failed(UPLOAD_ERROR_MESSAGE)
            }
            Err(err) => {
                warn!(attempt, "upload failed: {}", err);
                pending.failed(UPLOAD_ERROR_MESSAGE)
            }
        };

        publish(&self.upload, attempt, terminal.clone()).then_some(terminal)
    }

    /// Retrieves the drop behind `pickup_key` and hands it to the saver.
    ///
    /// Returns `None` when a newer download was started before this one finished.
    pub async fn start_download(&self, pickup_key: &str) -> Option<TransferState> {
        let attempt = self.next_attempt();
        let pending = TransferState::in_progress(Direction::Download, attempt, String::new());
        publish(&self.download, attempt, pending.clone());

        let pickup_key = pickup_key.trim();
        if pickup_key.is_empty() {
            warn!(attempt, "download requested without a pickup key");
            let terminal = pending.failed(DOWNLOAD_ERROR_MESSAGE);
            return publish(&self.download, attempt, terminal.clone()).then_some(terminal);
        }
        info!(attempt, pickup_key, "download started");

        let outcome =
            unless_superseded(&self.download, attempt, self.transport.retrieve(pickup_key))
                .await?;

        let terminal = match outcome {
            Ok(reply) if reply.is_success() => {
                let file_name = resolve_download_filename(reply.content_disposition.as_deref());
                if self.is_superseded(attempt) {
                    debug!(attempt, "download superseded before saving");
                    return None;
                }
                let saved_to = self.save(&file_name, reply.body).await;
                if self.is_superseded(attempt) {
                    debug!(attempt, "download superseded while saving");
                    if let Some(path) = saved_to {
                        discard(path).await;
                    }
                    return None;
                }
                TransferState {
                    file_name: Some(file_name),
                    saved_to,
                    ..pending.succeeded(pickup_key.to_owned())
                }
            }
            Ok(reply) => {
                warn!(attempt, pickup_key, status = reply.status, "download rejected");
                pending.failed(DOWNLOAD_ERROR_MESSAGE)
            }
            Err(err) => {
                warn!(attempt, pickup_key, "download failed: {}", err);
                pending.failed(DOWNLOAD_ERROR_MESSAGE)
            }
        };

        publish(&self.download, attempt, terminal.clone()).then_some(terminal)
    }

    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_superseded(&self, attempt: u64) -> bool {
        self.download.borrow().attempt > attempt
    }

    fn apply_tick(&self, attempt: u64, tick: ProgressTick) {
        let Some(percent) = progress_percent(tick.sent, tick.total) else {
            return;
        };
        self.upload.send_if_modified(|current| {
            current.attempt == attempt && current.advance_progress(percent)
        });
    }

    async fn save(&self, file_name: &str, payload: Bytes) -> Option<PathBuf> {
        let saver = Arc::clone(&self.saver);
        let name = file_name.to_owned();
        match tokio::task::spawn_blocking(move || saver.save(&name, &payload)).await {
            Ok(Ok(path)) => {
                info!(path = %path.display(), "download saved");
                Some(path)
            }
            Ok(Err(err)) => {
                error!(file_name, "failed to save download: {}", err);
                None
            }
            Err(err) => {
                error!(file_name, "save task failed: {}", err);
                None
            }
        }
    }
}

// A newer download owns the outcome, so a file saved by an older one is removed.
async fn discard(path: PathBuf) {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => debug!(path = %path.display(), "discarded superseded download"),
        Err(err) => warn!(path = %path.display(), "failed to discard superseded download: {}", err),
    }
}

fn publish(channel: &watch::Sender<TransferState>, attempt: u64, next: TransferState) -> bool {
    channel.send_if_modified(|current| {
        if current.attempt > attempt {
            return false;
        }
        *current = next;
        true
    })
}

async fn unless_superseded<F: Future>(
    channel: &watch::Sender<TransferState>,
    attempt: u64,
    work: F,
) -> Option<F::Output> {
    let mut watcher = channel.subscribe();
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return Some(output),
            Ok(()) = watcher.changed() => {
                if watcher.borrow_and_update().attempt > attempt {
                    debug!(attempt, "operation superseded");
                    return None;
                }
            }
        }
    }
}
