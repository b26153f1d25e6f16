use crate::error::{Error, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use std::sync::Arc;

/// What came back over the wire, before any JSON-RPC interpretation.
#[derive(Clone, Debug, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    /// `None` when the body was empty or not JSON.
    pub body: Option<Value>,
}

impl RawResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            status_text: "OK".to_string(),
            body: Some(body),
        }
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, body: &Value) -> Result<RawResponse>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, body: &Value) -> Result<RawResponse> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("POST {url} failed: {e}")))?;

        let status = resp.status();
        let text = resp.text().await?;
        Ok(RawResponse {
            status: status.as_u16(),
            status_text: status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string()),
            body: serde_json::from_str(&text).ok(),
        })
    }
}

/// Fields probed, in order, for a failure message when there is no `result`.
const ERROR_FIELDS: [&str; 6] = ["message", "msg", "data", "detail", "nonFieldErrors", "delegate"];

/// Interprets a response envelope.
///
/// Services in this ecosystem disagree on where they put failures, so the
/// order below is fixed: a non-JSON failure reports the status text; a
/// `result` key wins; then `error.message` and the [`ERROR_FIELDS`]; finally
/// the status text again.
pub fn interpret_response(resp: RawResponse) -> Result<Value> {
    let body = match resp.body {
        Some(body) => body,
        None if !resp.is_ok() => return Err(Error::Transport(resp.status_text)),
        None => {
            return Err(Error::Transport(format!(
                "{} with a body that is not JSON",
                resp.status_text
            )))
        }
    };

    if let Some(result) = body.get("result") {
        return Ok(result.clone());
    }

    let code = body
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(Value::as_i64);

    let nested = body.get("error").and_then(|e| e.get("message"));
    let message = nested
        .and_then(non_empty)
        .or_else(|| {
            ERROR_FIELDS
                .iter()
                .find_map(|k| body.get(*k).and_then(non_empty))
        });

    match message {
        Some(message) => Err(Error::Service { message, code }),
        None => Err(Error::Transport(resp.status_text)),
    }
}

fn non_empty(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(
            items
                .iter()
                .map(|i| match i {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("; "),
        ),
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

/// A JSON-RPC endpoint: one URL, one transport.
#[derive(Clone)]
pub struct RpcClient {
    url: String,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").field("url", &self.url).finish()
    }
}

impl RpcClient {
    pub fn new(url: String) -> Self {
        Self::with_transport(url, Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(url: String, transport: Arc<dyn Transport>) -> Self {
        Self { url, transport }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        tracing::debug!(method, url = %self.url, "json-rpc request");
        let resp = self.transport.post(&self.url, &req).await?;
        let out = interpret_response(resp);
        if let Err(e) = &out {
            tracing::debug!(method, error = %e, "json-rpc request failed");
        }
        out
    }
}
