use std::future::Future;

use bytes::Bytes;
use deaddrop_core::{CoreError, endpoint_url, retrieval_url, upload_content_disposition};
use futures::stream;
use reqwest::{
    Body, Client, Response,
    header::{self, HeaderMap},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

pub const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Bytes of the upload body handed to the HTTP stack so far.
///
/// Ticks are emitted as the client pulls each chunk into its send buffers, not
/// as bytes leave the socket, so a small body may jump straight to 100%.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressTick {
    pub sent: u64,
    pub total: Option<u64>,
}

pub type ProgressSink = mpsc::UnboundedSender<ProgressTick>;

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub mime_type: String,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub content_disposition: Option<String>,
    pub body: Bytes,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    InvalidUrl(#[from] CoreError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

pub trait Transport: Send + Sync + 'static {
    fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressSink,
    ) -> impl Future<Output = Result<HttpReply, TransportError>> + Send;

    fn retrieve(
        &self,
        pickup_key: &str,
    ) -> impl Future<Output = Result<HttpReply, TransportError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(server_url: &str) -> Result<Self, CoreError> {
        Ok(Self::with_client(Client::new(), endpoint_url(server_url)?))
    }

    pub fn with_client(client: Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressSink,
    ) -> Result<HttpReply, TransportError> {
        let total = request.body.len() as u64;
        let disposition = upload_content_disposition(&request.file_name);
        debug!(
            file_name = %request.file_name,
            bytes = total,
            endpoint = %self.endpoint,
            "starting upload"
        );

        let mut sent = 0_u64;
        let chunks = split_body(request.body).into_iter().map(move |chunk| {
            sent += chunk.len() as u64;
            // The receiver is gone once the controller stops listening.
            let _ = progress.send(ProgressTick {
                sent,
                total: Some(total),
            });
            Ok::<_, std::io::Error>(chunk)
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(header::CONTENT_TYPE, request.mime_type)
            .header(header::CONTENT_LENGTH, total.to_string())
            .header(header::CONTENT_DISPOSITION, disposition)
            .body(Body::wrap_stream(stream::iter(chunks)))
            .send()
            .await?;

        into_reply(response).await
    }

    async fn retrieve(&self, pickup_key: &str) -> Result<HttpReply, TransportError> {
        let url = retrieval_url(&self.endpoint, pickup_key)?;
        debug!(%url, "retrieving drop");
        let response = self.client.get(url).send().await?;
        into_reply(response).await
    }
}

async fn into_reply(response: Response) -> Result<HttpReply, TransportError> {
    let status = response.status().as_u16();
    let content_disposition = header_text(response.headers(), header::CONTENT_DISPOSITION);
    let body = response.bytes().await?;
    Ok(HttpReply {
        status,
        content_disposition,
        body,
    })
}

// Servers may send raw UTF-8 names; decode them best effort instead of dropping the header.
fn header_text(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
}

fn split_body(mut body: Bytes) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(body.len().div_ceil(UPLOAD_CHUNK_BYTES));
    while !body.is_empty() {
        let take = body.len().min(UPLOAD_CHUNK_BYTES);
        chunks.push(body.split_to(take));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_split_into_bounded_chunks() {
        let body = Bytes::from(vec![7_u8; UPLOAD_CHUNK_BYTES * 2 + 10]);
        let chunks = split_body(body);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), UPLOAD_CHUNK_BYTES);
        assert_eq!(chunks[2].len(), 10);
        assert!(split_body(Bytes::new()).is_empty());
    }

    #[test]
    fn only_2xx_replies_count_as_success() {
        let reply = |status| HttpReply {
            status,
            content_disposition: None,
            body: Bytes::new(),
        };
        assert!(reply(200).is_success());
        assert!(reply(204).is_success());
        assert!(!reply(404).is_success());
        assert!(!reply(500).is_success());
    }

    #[test]
    fn non_ascii_disposition_is_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_DISPOSITION,
            header::HeaderValue::from_bytes("attachment; filename=\"résumé.pdf\"".as_bytes())
                .unwrap(),
        );
        let text = header_text(&headers, header::CONTENT_DISPOSITION);
        assert_eq!(text.as_deref(), Some("attachment; filename=\"résumé.pdf\""));
        assert_eq!(
            deaddrop_core::resolve_download_filename(text.as_deref()),
            "résumé.pdf"
        );
        assert_eq!(header_text(&headers, header::CONTENT_TYPE), None);
    }

    #[test]
    fn transport_rejects_non_http_server_urls() {
        assert!(HttpTransport::new("ftp://example.com").is_err());
        let transport = HttpTransport::new("http://127.0.0.1:8080").unwrap();
        assert_eq!(
            transport.endpoint().as_str(),
            "http://127.0.0.1:8080/deaddrop"
        );
    }
}
