//! HTTP session shared by the REST, Salesforce and spreadsheet connectors
//!
//! Wraps one `reqwest::Client` with the retry policy (transient failures) and
//! the rate-limit policy (429 waits, which do not consume retry attempts).

use crate::connectors::retry::{RateLimitPolicy, RetryPolicy};
use crate::connectors::ConnectorContext;
use crate::error::{Result, SyncError};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub struct HttpSession {
    client: Option<Client>,
    retry: RetryPolicy,
    rate_limit: RateLimitPolicy,
}

impl HttpSession {
    pub fn new(context: &ConnectorContext) -> Result<Self> {
        let client = Client::builder()
            .timeout(context.request_timeout)
            .connect_timeout(context.request_timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| SyncError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client: Some(client),
            retry: context.retry.clone(),
            rate_limit: context.rate_limit.clone(),
        })
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| SyncError::Connection("HTTP session is closed".to_string()))
    }

    /// Send a request built by `build`, retrying transient failures, and
    /// decode the JSON body
    pub async fn get_json<F>(&self, operation: &str, build: F) -> Result<Value>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let client = self.client()?;
        let build = &build;
        self.retry
            .run(operation, || async move {
                let response = self.send_respecting_rate_limit(client, build).await?;
                Ok(response.json::<Value>().await?)
            })
            .await
    }

    /// Same as [`get_json`](Self::get_json) but returns the raw body text
    pub async fn get_text<F>(&self, operation: &str, build: F) -> Result<String>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let client = self.client()?;
        let build = &build;
        self.retry
            .run(operation, || async move {
                let response = self.send_respecting_rate_limit(client, build).await?;
                Ok(response.text().await?)
            })
            .await
    }

    async fn send_respecting_rate_limit<F>(&self, client: &Client, build: &F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut waits = 0u32;
        loop {
            let response = build(client).send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if let Some(err) = self.rate_limit.exhausted(waits) {
                    return Err(err);
                }
                let wait = self.rate_limit.wait_for(retry_after(&response));
                warn!("Rate limited by {}, waiting {:?}", response.url(), wait);
                tokio::time::sleep(wait).await;
                waits += 1;
                continue;
            }

            debug!("{} -> {}", response.url(), status);
            return check_status(response).await;
        }
    }

    pub fn close(&mut self) {
        self.client = None;
    }

    pub fn is_open(&self) -> bool {
        self.client.is_some()
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Map HTTP status codes onto the error taxonomy
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} returned {}: {}", url, status, truncate(&body, 300));

    Err(match status {
        StatusCode::NOT_FOUND => SyncError::NotFound(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SyncError::Connection(format!("authentication failed: {}", detail))
        }
        StatusCode::REQUEST_TIMEOUT => SyncError::Connection(detail),
        s if s.is_server_error() => SyncError::Connection(detail),
        _ => SyncError::Validation(detail),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Follow a dot-separated path (`data.items`) into a JSON document
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;
    use tiny_http::{Header, Response as TinyResponse, Server};

    fn context() -> ConnectorContext {
        ConnectorContext {
            retry: RetryPolicy::new(3, Duration::from_millis(5)),
            rate_limit: RateLimitPolicy {
                base_delay: Duration::from_millis(5),
                max_waits: 2,
            },
            ..ConnectorContext::default()
        }
    }

    #[tokio::test]
    async fn test_rate_limit_wait_does_not_consume_retries() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let handle = thread::spawn(move || {
            // two 429s, one 503, then success: 4 requests with a 3-attempt policy
            for i in 0..4 {
                let request = server.recv().unwrap();
                let response = match i {
                    0 | 1 => TinyResponse::from_string("slow down")
                        .with_status_code(429)
                        .with_header(Header::from_bytes("Retry-After", "0").unwrap()),
                    2 => TinyResponse::from_string("unavailable").with_status_code(503),
                    _ => TinyResponse::from_string(r#"{"ok": true}"#),
                };
                request.respond(response).unwrap();
            }
        });

        let session = HttpSession::new(&context()).unwrap();
        let url = format!("http://{}/ping", addr);
        let body = session.get_json("ping", |c| c.get(&url)).await.unwrap();
        handle.join().unwrap();
        assert_eq!(body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_rate_limit_ceiling_surfaces_error() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let handle = thread::spawn(move || {
            for _ in 0..3 {
                let request = server.recv().unwrap();
                request
                    .respond(TinyResponse::from_string("slow down").with_status_code(429))
                    .unwrap();
            }
        });

        let session = HttpSession::new(&context()).unwrap();
        let url = format!("http://{}/ping", addr);
        let err = session.get_json("ping", |c| c.get(&url)).await.unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, SyncError::RateLimited(_)));
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_ip().unwrap();
        let handle = thread::spawn(move || {
            let request = server.recv().unwrap();
            request
                .respond(TinyResponse::from_string("missing").with_status_code(404))
                .unwrap();
        });

        let session = HttpSession::new(&context()).unwrap();
        let url = format!("http://{}/nope", addr);
        let err = session.get_json("lookup", |c| c.get(&url)).await.unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_json_path() {
        let doc = json!({"data": {"items": [{"id": 1}], "next": null}});
        assert_eq!(json_path(&doc, "data.items.0.id"), Some(&json!(1)));
        assert_eq!(json_path(&doc, "data.next"), Some(&Value::Null));
        assert_eq!(json_path(&doc, "data.missing"), None);
        assert_eq!(json_path(&doc, ""), Some(&doc));
    }
}
