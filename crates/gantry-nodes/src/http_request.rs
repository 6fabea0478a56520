//! HTTP request node
//!
//! Performs one HTTP call. The request honors the cooperative cancellation
//! signal and the remaining run budget: whichever of the configured timeout
//! and the run deadline is tighter becomes the request timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use gantry_core::{
    Envelope, ExecutionContext, NodeDefinition, NodeError, NodeMeta, NodeOutcome, OptionItem,
    ParameterKind, ParameterSpec, ParameterValidator,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeDefinition for HttpRequestNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("http_request", "HTTP Request", "network")
            .parameter(
                ParameterSpec::string("url", "URL")
                    .required()
                    .validator(ParameterValidator::NonEmpty),
            )
            .parameter(
                ParameterSpec::enumeration(
                    "method",
                    "Method",
                    ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"]
                        .into_iter()
                        .map(|m| OptionItem::new(m, m))
                        .collect(),
                )
                .with_default("GET"),
            )
            .parameter(ParameterSpec::new("headers", "Headers", ParameterKind::Object))
            .parameter(
                ParameterSpec::new("body", "Body", ParameterKind::Object)
                    .visible_if("method", "POST")
                    .in_group("request"),
            )
            .parameter(
                ParameterSpec::integer("timeout_seconds", "Timeout (seconds)").with_default(30),
            )
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        config: &Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let url = config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::config("http_request requires a url"))?;
        let method: reqwest::Method = config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .parse()
            .map_err(|_| NodeError::config("invalid HTTP method"))?;

        let configured_timeout = config
            .get("timeout_seconds")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        let timeout = match ctx.remaining_budget() {
            Some(budget) => configured_timeout.min(budget),
            None => configured_timeout,
        };

        let mut request = self.client.request(method, url).timeout(timeout);

        if let Some(Value::Object(headers)) = config.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        if let Some(body) = config.get("body") {
            request = request.json(body);
        }

        debug!(%url, "http_request executing");

        let response = tokio::select! {
            result = request.send() => {
                result.map_err(|e| NodeError::failed(format!("request failed: {}", e)))?
            }
            _ = ctx.cancelled() => return Err(NodeError::Cancelled),
        };

        let status = response.status().as_u16();
        let text = tokio::select! {
            result = response.text() => {
                result.map_err(|e| NodeError::failed(format!("body read failed: {}", e)))?
            }
            _ = ctx.cancelled() => return Err(NodeError::Cancelled),
        };

        if status >= 400 {
            return Err(NodeError::failed(format!(
                "upstream returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        let data = serde_json::json!({ "status": status, "body": body });

        Ok(NodeOutcome::Envelope(input.with_data(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ctx;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_url_is_config_error() {
        let (ctx, trace) = ctx("http1");
        let input = Envelope::new(json!({}), trace);

        let err = HttpRequestNode::new()
            .execute(&ctx, &json!({}), input)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_method_is_config_error() {
        let (ctx, trace) = ctx("http1");
        let input = Envelope::new(json!({}), trace);
        let config = json!({"url": "http://localhost:1", "method": "TELEPORT"});

        let err = HttpRequestNode::new()
            .execute(&ctx, &config, input)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let (ctx, trace) = ctx("http1");
        let input = Envelope::new(json!({}), trace);
        // Port 1 is never listening
        let config = json!({"url": "http://127.0.0.1:1/", "timeout_seconds": 1});

        let err = HttpRequestNode::new()
            .execute(&ctx, &config, input)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
