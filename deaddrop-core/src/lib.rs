use std::{path::PathBuf, time::Duration};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const UPLOAD_PATH_SEGMENT: &str = "deaddrop";
pub const DEFAULT_DOWNLOAD_FILENAME: &str = "downloaded_file";
pub const UPLOAD_ERROR_MESSAGE: &str = "Error uploading file";
pub const DOWNLOAD_ERROR_MESSAGE: &str = "Failed to download file. Check your pickup key.";
pub const FEEDBACK_DELAY: Duration = Duration::from_millis(1000);
pub const FALLBACK_EXTENSION: &str = ".data";

/// Characters left untouched by JavaScript's `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const MIME_TABLE: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("wasm", "application/wasm"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferStatus {
    Idle,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FeedbackKind {
    CopyId,
    CopyLink,
}

/// Snapshot of one upload or download attempt.
///
/// `attempt` is the generation tag of the operation that produced the snapshot;
/// results from an older attempt never replace a newer one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    pub direction: Direction,
    pub status: TransferStatus,
    pub progress_percent: u8,
    pub pickup_key: Option<String>,
    pub file_extension: String,
    pub error_message: Option<String>,
    pub file_name: Option<String>,
    pub saved_to: Option<PathBuf>,
    pub attempt: u64,
}

impl TransferState {
    #[must_use]
    pub fn idle(direction: Direction) -> Self {
        Self {
            direction,
            status: TransferStatus::Idle,
            progress_percent: 0,
            pickup_key: None,
            file_extension: String::new(),
            error_message: None,
            file_name: None,
            saved_to: None,
            attempt: 0,
        }
    }

    #[must_use]
    pub fn in_progress(direction: Direction, attempt: u64, file_extension: String) -> Self {
        Self {
            status: TransferStatus::InProgress,
            file_extension,
            attempt,
            ..Self::idle(direction)
        }
    }

    #[must_use]
    pub fn succeeded(self, pickup_key: String) -> Self {
        Self {
            status: TransferStatus::Succeeded,
            progress_percent: 0,
            pickup_key: Some(pickup_key),
            error_message: None,
            ..self
        }
    }

    #[must_use]
    pub fn failed(self, message: &str) -> Self {
        Self {
            status: TransferStatus::Failed,
            progress_percent: 0,
            pickup_key: None,
            error_message: Some(message.to_owned()),
            file_name: None,
            saved_to: None,
            ..self
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Succeeded | TransferStatus::Failed
        )
    }

    /// Raises the upload progress; never moves it backwards.
    ///
    /// Returns `true` when the snapshot changed.
    pub fn advance_progress(&mut self, percent: u8) -> bool {
        if self.direction != Direction::Upload || self.status != TransferStatus::InProgress {
            return false;
        }
        let percent = percent.min(100);
        if percent <= self.progress_percent {
            return false;
        }
        self.progress_percent = percent;
        true
    }

    /// `<endpoint>/<key>.<ext>`, available once an upload produced a key and the
    /// file had an extension.
    pub fn share_link(&self, endpoint: &Url) -> Option<String> {
        if self.status != TransferStatus::Succeeded || self.direction != Direction::Upload {
            return None;
        }
        share_link(endpoint, self.pickup_key.as_deref()?, &self.file_extension)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadReceipt {
    pub id: String,
}

impl UploadReceipt {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropZone {
    active: bool,
}

impl DropZone {
    pub fn hover(&mut self) {
        self.active = true;
    }

    pub fn leave(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn drop_files<T>(&mut self, files: impl IntoIterator<Item = T>) -> Option<T> {
        self.active = false;
        files.into_iter().next()
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("pickup key must not be empty")]
    EmptyPickupKey,
    #[error("invalid server url: {0}")]
    InvalidServerUrl(String),
}

/// Trailing `.<alphanumeric>+` of `filename`, case preserved; empty when absent.
pub fn file_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((_, suffix))
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            suffix.to_owned()
        }
        _ => String::new(),
    }
}

pub fn progress_percent(sent: u64, total: Option<u64>) -> Option<u8> {
    let total = total.filter(|total| *total > 0)?;
    let percent = (sent as f64 / total as f64 * 100.0).round();
    Some(percent.clamp(0.0, 100.0) as u8)
}

pub fn encode_filename(name: &str) -> String {
    utf8_percent_encode(name, URI_COMPONENT).to_string()
}

pub fn upload_content_disposition(name: &str) -> String {
    format!("attachment; filename=\"{}\"", encode_filename(name))
}

/// Raw value captured by `filename="?([^"]+)"?`.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    const NEEDLE: &str = "filename=";

    let mut rest = header;
    while let Some(at) = rest.find(NEEDLE) {
        let after = &rest[at + NEEDLE.len()..];
        let value = after.strip_prefix('"').unwrap_or(after);
        let captured = value.split('"').next().unwrap_or_default();
        if !captured.is_empty() {
            return Some(captured.to_owned());
        }
        rest = after;
    }
    None
}

pub fn resolve_download_filename(content_disposition: Option<&str>) -> String {
    let Some(raw) = content_disposition.and_then(filename_from_content_disposition) else {
        return DEFAULT_DOWNLOAD_FILENAME.to_owned();
    };
    match percent_decode_str(&raw).decode_utf8() {
        Ok(decoded) if !decoded.is_empty() => decoded.into_owned(),
        _ => raw,
    }
}

/// Resolves `<server>/deaddrop`, keeping any path prefix of `server_url`.
pub fn endpoint_url(server_url: &str) -> Result<Url, CoreError> {
    let mut base =
        Url::parse(server_url.trim()).map_err(|err| CoreError::InvalidServerUrl(err.to_string()))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(CoreError::InvalidServerUrl(format!(
            "unsupported scheme {}",
            base.scheme()
        )));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(UPLOAD_PATH_SEGMENT)
        .map_err(|err| CoreError::InvalidServerUrl(err.to_string()))
}

/// Retrieval URL for a pickup key; the key is escaped as a single path segment.
pub fn retrieval_url(endpoint: &Url, pickup_key: &str) -> Result<Url, CoreError> {
    let pickup_key = pickup_key.trim();
    if pickup_key.is_empty() {
        return Err(CoreError::EmptyPickupKey);
    }
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .map_err(|_| CoreError::InvalidServerUrl(endpoint.to_string()))?
        .pop_if_empty()
        .push(pickup_key);
    Ok(url)
}

pub fn share_link(endpoint: &Url, pickup_key: &str, extension: &str) -> Option<String> {
    if pickup_key.is_empty() || extension.is_empty() {
        return None;
    }
    let base = endpoint.as_str().trim_end_matches('/');
    Some(format!("{base}/{pickup_key}.{extension}"))
}

pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    MIME_TABLE
        .iter()
        .find(|(ext, _)| ext.eq_ignore_ascii_case(extension))
        .map(|(_, mime)| *mime)
}

/// Extension (with leading dot) registered for a MIME type, parameters ignored.
pub fn extension_for_mime(mime: &str) -> Option<String> {
    let essence = mime.split(';').next().unwrap_or_default().trim();
    MIME_TABLE
        .iter()
        .find(|(_, candidate)| candidate.eq_ignore_ascii_case(essence))
        .map(|(ext, _)| format!(".{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Url {
        endpoint_url("https://drop.example.com").unwrap()
    }

    #[test]
    fn extension_takes_last_alphanumeric_suffix() {
        assert_eq!(file_extension("notes.txt"), "txt");
        assert_eq!(file_extension("archive.tar.gz"), "gz");
        assert_eq!(file_extension("Photo.JPEG"), "JPEG");
        assert_eq!(file_extension("README"), "");
        assert_eq!(file_extension("trailing."), "");
        assert_eq!(file_extension("weird.ta-r"), "");
        assert_eq!(file_extension(".bashrc"), "bashrc");
    }

    #[test]
    fn progress_is_rounded_and_bounded() {
        assert_eq!(progress_percent(0, Some(10)), Some(0));
        assert_eq!(progress_percent(1, Some(3)), Some(33));
        assert_eq!(progress_percent(2, Some(3)), Some(67));
        assert_eq!(progress_percent(999, Some(1000)), Some(100));
        assert_eq!(progress_percent(10, Some(10)), Some(100));
        assert_eq!(progress_percent(20, Some(10)), Some(100));
        assert_eq!(progress_percent(5, None), None);
        assert_eq!(progress_percent(5, Some(0)), None);
    }

    #[test]
    fn filename_encoding_matches_uri_component_rules() {
        assert_eq!(encode_filename("report.pdf"), "report.pdf");
        assert_eq!(encode_filename("my file (1).txt"), "my%20file%20(1).txt");
        assert_eq!(encode_filename("résumé.pdf"), "r%C3%A9sum%C3%A9.pdf");
        assert_eq!(
            upload_content_disposition("a b.txt"),
            "attachment; filename=\"a%20b.txt\""
        );
    }

    #[test]
    fn content_disposition_filename_quotes_are_optional() {
        assert_eq!(
            filename_from_content_disposition("attachment; filename=\"report.pdf\"").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(
            filename_from_content_disposition("attachment; filename=report.pdf").as_deref(),
            Some("report.pdf")
        );
        assert_eq!(filename_from_content_disposition("attachment"), None);
        assert_eq!(filename_from_content_disposition("attachment; filename=\"\""), None);
    }

    #[test]
    fn download_filename_is_decoded_or_defaulted() {
        assert_eq!(
            resolve_download_filename(Some("attachment; filename=\"report.pdf\"")),
            "report.pdf"
        );
        assert_eq!(
            resolve_download_filename(Some("attachment; filename=\"my%20notes.txt\"")),
            "my notes.txt"
        );
        assert_eq!(resolve_download_filename(None), DEFAULT_DOWNLOAD_FILENAME);
        assert_eq!(
            resolve_download_filename(Some("inline")),
            DEFAULT_DOWNLOAD_FILENAME
        );
        // %FF is not valid UTF-8 once decoded, so the raw capture is kept.
        assert_eq!(
            resolve_download_filename(Some("attachment; filename=\"bad%FF.bin\"")),
            "bad%FF.bin"
        );
    }

    #[test]
    fn endpoint_keeps_path_prefix() {
        assert_eq!(endpoint().as_str(), "https://drop.example.com/deaddrop");
        let prefixed = endpoint_url("http://localhost:8080/share").unwrap();
        assert_eq!(prefixed.as_str(), "http://localhost:8080/share/deaddrop");
        assert!(endpoint_url("ftp://example.com").is_err());
        assert!(endpoint_url("not a url").is_err());
    }

    #[test]
    fn retrieval_url_escapes_key() {
        let url = retrieval_url(&endpoint(), "xk72q").unwrap();
        assert_eq!(url.as_str(), "https://drop.example.com/deaddrop/xk72q");
        let url = retrieval_url(&endpoint(), "a/b").unwrap();
        assert_eq!(url.as_str(), "https://drop.example.com/deaddrop/a%2Fb");
        assert!(matches!(
            retrieval_url(&endpoint(), "  "),
            Err(CoreError::EmptyPickupKey)
        ));
    }

    #[test]
    fn share_link_requires_key_and_extension() {
        assert_eq!(
            share_link(&endpoint(), "xk72q", "txt").as_deref(),
            Some("https://drop.example.com/deaddrop/xk72q.txt")
        );
        assert_eq!(share_link(&endpoint(), "xk72q", ""), None);
        assert_eq!(share_link(&endpoint(), "", "txt"), None);
    }

    #[test]
    fn terminal_states_carry_exactly_one_outcome() {
        let running = TransferState::in_progress(Direction::Upload, 3, "txt".to_owned());
        assert!(!running.is_terminal());
        assert!(running.pickup_key.is_none() && running.error_message.is_none());

        let mut ticking = running.clone();
        assert!(ticking.advance_progress(55));
        let done = ticking.succeeded("xk72q".to_owned());
        assert!(done.is_terminal());
        assert_eq!(done.progress_percent, 0);
        assert_eq!(done.pickup_key.as_deref(), Some("xk72q"));
        assert!(done.error_message.is_none());
        assert_eq!(done.file_extension, "txt");
        assert_eq!(done.attempt, 3);

        let failed = running.failed(UPLOAD_ERROR_MESSAGE);
        assert!(failed.is_terminal());
        assert!(failed.pickup_key.is_none());
        assert_eq!(failed.error_message.as_deref(), Some(UPLOAD_ERROR_MESSAGE));
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut state = TransferState::in_progress(Direction::Upload, 1, String::new());
        assert!(state.advance_progress(40));
        assert!(!state.advance_progress(30));
        assert!(!state.advance_progress(40));
        assert!(state.advance_progress(250));
        assert_eq!(state.progress_percent, 100);

        let mut download = TransferState::in_progress(Direction::Download, 1, String::new());
        assert!(!download.advance_progress(10));
    }

    #[test]
    fn state_share_link_only_for_successful_upload() {
        let done = TransferState::in_progress(Direction::Upload, 1, "txt".to_owned())
            .succeeded("xk72q".to_owned());
        assert_eq!(
            done.share_link(&endpoint()).as_deref(),
            Some("https://drop.example.com/deaddrop/xk72q.txt")
        );

        let no_ext = TransferState::in_progress(Direction::Upload, 1, String::new())
            .succeeded("xk72q".to_owned());
        assert_eq!(no_ext.share_link(&endpoint()), None);
    }

    #[test]
    fn upload_receipt_requires_id() {
        let receipt = UploadReceipt::parse(br#"{"id":"xk72q"}"#).unwrap();
        assert_eq!(receipt.id, "xk72q");
        assert!(UploadReceipt::parse(b"{}").is_err());
        assert!(UploadReceipt::parse(b"<html>").is_err());
    }

    #[test]
    fn mime_table_round_trips_common_types() {
        assert_eq!(mime_for_extension("TXT"), Some("text/plain"));
        assert_eq!(mime_for_extension("unknown"), None);
        assert_eq!(
            extension_for_mime("text/plain; charset=utf-8").as_deref(),
            Some(".txt")
        );
        assert_eq!(extension_for_mime("application/x-whatever"), None);
    }

    #[test]
    fn drop_zone_keeps_first_file_and_clears_highlight() {
        let mut zone = DropZone::default();
        zone.hover();
        assert!(zone.is_active());
        let first = zone.drop_files(["a.txt", "b.txt", "c.txt"]);
        assert_eq!(first, Some("a.txt"));
        assert!(!zone.is_active());

        zone.hover();
        zone.leave();
        assert!(!zone.is_active());
        assert_eq!(zone.drop_files(Vec::<&str>::new()), None);
    }
}
