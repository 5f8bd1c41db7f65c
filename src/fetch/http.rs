//! Plain HTTP GET fetcher used as the static fallback.
//!
//! Suits pages that do not need script execution, and pages that make a
//! headless browser choke on transport quirks. Bodies are decoded with the
//! charset the server declares (Big5 and GBK pages are common), falling back
//! to UTF-8.

use super::{FailureKind, FetchFailure, FetchStrategy, Fetcher};
use reqwest::header::{CONTENT_DISPOSITION, HeaderMap, USER_AGENT};
use reqwest::{Client, redirect};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }
}

/// Whether the response asks the client to save a file rather than render.
fn is_attachment(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("attachment"))
        .unwrap_or(false)
}

fn classify(e: &reqwest::Error) -> FailureKind {
    if e.is_timeout() {
        FailureKind::Timeout
    } else if e.is_status() || e.is_redirect() || e.is_decode() {
        FailureKind::Protocol
    } else {
        FailureKind::Transport
    }
}

impl Fetcher for HttpFetcher {
    #[instrument(level = "debug", skip_all, fields(%url, %strategy))]
    async fn fetch(
        &self,
        url: &str,
        strategy: &FetchStrategy,
        timeout: Duration,
    ) -> Result<String, FetchFailure> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchFailure::new(classify(&e), e.to_string()))?;

        if is_attachment(response.headers()) {
            return Err(FetchFailure::new(
                FailureKind::Download,
                "response is a file attachment",
            ));
        }

        let response = response
            .error_for_status()
            .map_err(|e| FetchFailure::new(FailureKind::Protocol, e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| FetchFailure::new(classify(&e), e.to_string()))?;
        debug!(bytes = body.len(), "HTTP fetch complete");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer exactly one request on a loopback port with `head` + `body`.
    async fn serve_once(head: &str, body: &[u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut response = format!(
            "HTTP/1.1 200 OK\r\n{head}Content-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket.write_all(&response).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/article")
    }

    #[tokio::test]
    async fn test_declared_charset_is_decoded() {
        // "大火" in Big5.
        let url = serve_once(
            "Content-Type: text/html; charset=big5\r\n",
            &[0xA4, 0x6A, 0xA4, 0xF5],
        )
        .await;
        let fetcher = HttpFetcher::new("test-agent").unwrap();

        let body = fetcher
            .fetch(&url, &FetchStrategy::StaticFallback, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(body, "大火");
    }

    #[tokio::test]
    async fn test_attachment_response_is_download() {
        let url = serve_once(
            "Content-Type: application/pdf\r\nContent-Disposition: attachment; filename=\"a.pdf\"\r\n",
            b"%PDF-1.4",
        )
        .await;
        let fetcher = HttpFetcher::new("test-agent").unwrap();

        let failure = fetcher
            .fetch(&url, &FetchStrategy::StaticFallback, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Download);
    }

    #[test]
    fn test_attachment_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_attachment(&headers));

        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"report.pdf\""),
        );
        assert!(is_attachment(&headers));

        headers.insert(CONTENT_DISPOSITION, HeaderValue::from_static("inline"));
        assert!(!is_attachment(&headers));
    }
}
