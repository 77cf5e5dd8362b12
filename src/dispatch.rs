//! Delivery channels that carry signed claims towards the server.

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::DyndnsError;
use crate::record::UpdateRecordRequest;

/// Default timeout for a single HTTP delivery.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// A transport able to deliver one claim.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver `request`; `Ok` means the transport accepted it.
    async fn notify(&self, request: &UpdateRecordRequest) -> Result<(), DyndnsError>;
}

/// In-process transport writing straight into a server's inbound channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::Sender<UpdateRecordRequest>,
}

impl ChannelDispatcher {
    /// Wrap the sending half of an inbound claim channel.
    pub fn new(sender: mpsc::Sender<UpdateRecordRequest>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn notify(&self, request: &UpdateRecordRequest) -> Result<(), DyndnsError> {
        self.sender.send(request.clone()).await.map_err(|_| {
            DyndnsError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "inbound channel closed",
            ))
        })
    }
}

/// Transport posting the claim as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: HttpClient,
    url: String,
}

impl HttpDispatcher {
    /// Create a dispatcher posting to `url` with the default timeout.
    pub fn new(url: impl Into<String>) -> Result<Self, DyndnsError> {
        Self::with_timeout(url, DEFAULT_HTTP_TIMEOUT)
    }

    /// Create a dispatcher posting to `url` with a custom timeout.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, DyndnsError> {
        let url = url.into();
        if url.is_empty() {
            return Err(DyndnsError::Config("empty dispatch url provided".into()));
        }
        let client = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn notify(&self, request: &UpdateRecordRequest) -> Result<(), DyndnsError> {
        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();

        if status != StatusCode::OK {
            error!(url = %self.url, status = status.as_u16(), "bad response from http dispatch");
            return Err(DyndnsError::Io(std::io::Error::other(format!(
                "http dispatcher received status code {}",
                status.as_u16()
            ))));
        }

        debug!(url = %self.url, status = status.as_u16(), "http dispatcher received reply");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DnsRecord;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> UpdateRecordRequest {
        let record = DnsRecord::new("home.example.com").with_ipv4("203.0.113.5".parse().unwrap());
        UpdateRecordRequest::new(record, "c2ln".into())
    }

    #[tokio::test]
    async fn test_channel_dispatch_forwards() {
        let (tx, mut rx) = mpsc::channel(1);
        let dispatcher = ChannelDispatcher::new(tx);

        dispatcher.notify(&request()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), request());
    }

    #[tokio::test]
    async fn test_channel_dispatch_closed_errors() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let dispatcher = ChannelDispatcher::new(tx);
        assert!(dispatcher.notify(&request()).await.is_err());
    }

    #[tokio::test]
    async fn test_http_dispatch_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update"))
            .and(body_partial_json(serde_json::json!({
                "signature": "c2ln",
                "public_ip": { "host": "home.example.com", "ipv4": "203.0.113.5" }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new(format!("{}/update", server.uri())).unwrap();
        dispatcher.notify(&request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_dispatch_non_200_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new(format!("{}/update", server.uri())).unwrap();
        let err = dispatcher.notify(&request()).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_http_dispatch_requires_url() {
        assert!(HttpDispatcher::new("").is_err());
    }
}
