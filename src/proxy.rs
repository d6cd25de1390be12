use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{truncate, SharedLogger};
use crate::translate::response::{rewrite_response_body, upstream_error_body};
use crate::translate::sse::EventRewriter;
use crate::translate::streaming::{RelayBody, RelaySession};

use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

/// Outcome of proxying a streaming request.
pub enum StreamReply {
    /// Upstream accepted the request; relay its events.
    Events(RelayBody),
    /// Upstream refused the request before streaming. No event stream is
    /// opened and the error is returned as JSON with the upstream status.
    Rejected(u16, Value),
}

/// POST the caller's request body to the upstream chat completion endpoint.
///
/// The credential is forwarded verbatim as the upstream `Authorization` header.
pub async fn forward_chat_completion(
    request: &Value,
    credential: &HeaderValue,
    streaming: bool,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<reqwest::Response> {
    let url = config.chat_completions_url()?;
    let model = request.get("model").and_then(Value::as_str).unwrap_or("-");

    let mut builder = client
        .post(&url)
        .header(AUTHORIZATION, credential.clone())
        .header(CONTENT_TYPE, "application/json")
        .json(request);

    for (name, value) in &config.upstream.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::warn!(header = %name, "Skipping invalid upstream header from config");
            continue;
        };
        builder = builder.header(name, value);
    }

    // A stream's body reads are bounded by the relay's idle timeout instead.
    if !streaming {
        builder = builder.timeout(config.request_timeout());
    }

    logger.info(
        "proxy",
        format!("POST {} model={} streaming={}", url, model, streaming),
    );

    let sent = match (streaming, config.idle_timeout()) {
        (true, Some(limit)) => tokio::time::timeout(limit, builder.send())
            .await
            .map_err(|_| {
                logger.error(
                    "proxy",
                    format!("No response headers within {}s", limit.as_secs_f32()),
                );
                ProxyError::upstream(format!(
                    "No response received from upstream for {}s.",
                    limit.as_secs_f32()
                ))
            })?,
        _ => builder.send().await,
    };

    let response = sent.inspect_err(|e| {
        tracing::error!(error = %e, url = %url, "Upstream request failed");
        logger.error("proxy", format!("Request failed: {}", e));
    })?;

    tracing::info!(
        url = %url,
        model,
        streaming,
        status = response.status().as_u16(),
        "Upstream responded"
    );
    Ok(response)
}

/// Forward a non-streaming request and rewrite the complete response body.
///
/// Returns the upstream status together with the rewritten body.
pub async fn proxy_non_streaming(
    request: &Value,
    credential: &HeaderValue,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<(u16, Value)> {
    let reasoning_format = config.reasoning_format()?;
    let response =
        forward_chat_completion(request, credential, false, config, client, logger).await?;

    let status = response.status().as_u16();
    let body = response.bytes().await.inspect_err(|e| {
        logger.error("proxy", format!("Failed to read response body: {}", e));
    })?;

    logger.info(
        "proxy",
        format!("Response status={} body_len={}", status, body.len()),
    );

    let payload = rewrite_response_body(reasoning_format, &body).map_err(|e| {
        logger.error("proxy", e.to_string());
        e
    })?;

    Ok((status, payload))
}

/// Forward a streaming request and open a relay over the upstream event stream.
pub async fn proxy_streaming(
    request: &Value,
    credential: &HeaderValue,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<StreamReply> {
    let reasoning_format = config.reasoning_format()?;
    let response =
        forward_chat_completion(request, credential, true, config, client, logger).await?;

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let body = response.bytes().await.unwrap_or_default();
        logger.warn(
            "proxy",
            format!(
                "Streaming error status={}: {}",
                status,
                truncate(&String::from_utf8_lossy(&body), 300)
            ),
        );
        return Ok(StreamReply::Rejected(status, upstream_error_body(&body)));
    }

    let session = RelaySession::new(
        response.bytes_stream(),
        EventRewriter::new(reasoning_format),
        logger.clone(),
    )
    .with_idle_timeout(config.idle_timeout())
    .with_max_line_bytes(config.max_line_bytes());

    logger.info("proxy", format!("Streaming session={} opened", session.id()));

    Ok(StreamReply::Events(session.start().await?))
}
