//! Remote face matcher.
//!
//! The matcher receives a still image plus the user id and answers with the
//! roster entries it believes are in the picture, ranked by confidence. An
//! empty answer is a valid result; a failed call is reported separately.

use crate::types::Candidate;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("matcher unreachable: {0}")]
    Unreachable(String),
    #[error("matcher returned HTTP {0}: {1}")]
    Status(u16, String),
    #[error("malformed matcher response: {0}")]
    Malformed(String),
    #[error("matcher timed out after {0:?}")]
    Timeout(Duration),
}

/// Strategy for identifying the people in a captured image.
pub trait Matcher {
    /// Ranked candidates for `image`, in the order the service returned them.
    fn find_matches(
        &self,
        image: &[u8],
        user: &str,
    ) -> impl Future<Output = Result<Vec<Candidate>, MatchError>> + Send;
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    matches: Vec<Candidate>,
}

/// HTTP client for the recognition service.
///
/// `POST {base_url}/recognize?user=<id>` with the JPEG as the request body.
#[derive(Clone)]
pub struct RemoteMatcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RemoteMatcher {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/recognize", self.base_url)
    }

    async fn recognize(&self, image: &[u8], user: &str) -> Result<Vec<Candidate>, MatchError> {
        let url = self.endpoint();
        tracing::debug!(url = %url, user, bytes = image.len(), "submitting image to matcher");

        let response = self
            .client
            .post(&url)
            .query(&[("user", user)])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(image.to_vec())
            .send()
            .await
            .map_err(|e| MatchError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MatchError::Status(status.as_u16(), body));
        }

        let parsed: RecognizeResponse = response
            .json()
            .await
            .map_err(|e| MatchError::Malformed(e.to_string()))?;

        tracing::debug!(candidates = parsed.matches.len(), "matcher responded");
        Ok(parsed.matches)
    }
}

impl Matcher for RemoteMatcher {
    /// The deadline covers the whole exchange, body included.
    async fn find_matches(&self, image: &[u8], user: &str) -> Result<Vec<Candidate>, MatchError> {
        tokio::time::timeout(self.timeout, self.recognize(image, user))
            .await
            .map_err(|_| MatchError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let m = RemoteMatcher::new("http://127.0.0.1:3000/", Duration::from_secs(1));
        assert_eq!(m.endpoint(), "http://127.0.0.1:3000/recognize");
    }

    #[test]
    fn test_parse_response_order_preserved() {
        let raw = r#"{"matches":[
            {"contactId":"1","name":"Samantha R.","relationship":"Wife","confidence":0.9},
            {"contactId":"2","name":"Sarah J","relationship":"Daughter","avatar":"a.jpg","confidence":0.95}
        ]}"#;
        let parsed: RecognizeResponse = serde_json::from_str(raw).unwrap();
        let ids: Vec<_> = parsed.matches.iter().map(|c| c.contact_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(parsed.matches[1].avatar.as_deref(), Some("a.jpg"));
    }

    #[test]
    fn test_parse_empty_response() {
        let parsed: RecognizeResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.matches.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let m = RemoteMatcher::new(&format!("http://{addr}"), Duration::from_secs(2));
        let result = m.find_matches(b"jpeg", "alice").await;
        assert!(matches!(result, Err(MatchError::Unreachable(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"mat")
                .await
                .unwrap();
            // Headers sent, body never finishes
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });

        let m = RemoteMatcher::new(&format!("http://{addr}"), Duration::from_millis(300));
        let started = Instant::now();
        let result = m.find_matches(b"jpeg", "alice").await;
        assert!(matches!(result, Err(MatchError::Timeout(_))), "got {result:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
