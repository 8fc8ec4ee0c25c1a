//! Core relay logic: translate each request for its routed backend, issue
//! the upstream call, and translate the response back.
//!
//! Unary and streaming paths are separate; the streaming path hands the
//! upstream body to the framers in [`crate::stream`]. Anthropic-kind
//! backends are a passthrough: only the model field and auth headers change.

use bytes::Bytes;

use crate::config::ProviderKind;
use crate::error::{RelayError, Result};
use crate::logging::SharedLogger;
use crate::route::ResolvedRoute;
use crate::stream::{
    frame_anthropic_stream, frame_gemini_stream, frame_openai_stream, SseStream,
};
use crate::translate::anthropic::{MessagesRequest, MessagesResponse};
use crate::translate::gemini::{anthropic_to_gemini, gemini_to_anthropic, GenerateContentResponse};
use crate::translate::openai::{anthropic_to_openai, openai_to_anthropic, ChatCompletionResponse};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const ERROR_BODY_LIMIT: usize = 500;

/// Outcome of a unary relay.
pub enum UnaryOutcome {
    /// Response translated into the Anthropic shape.
    Translated(MessagesResponse),
    /// Anthropic passthrough: upstream status and body, unchanged.
    Raw { status: u16, body: Bytes },
}

/// Reject request bodies the dispatcher refuses to route.
pub fn validate_request(req: &MessagesRequest) -> Result<()> {
    if req.model.is_empty() {
        return Err(RelayError::bad_request("model field is required"));
    }
    if req.max_tokens == 0 {
        return Err(RelayError::bad_request("max_tokens must be greater than 0"));
    }
    if req.messages.is_empty() {
        return Err(RelayError::bad_request(
            "messages field is required and must be non-empty",
        ));
    }
    Ok(())
}

/// Relay a non-streaming request to the routed backend.
pub async fn relay_unary(
    req: &MessagesRequest,
    route: &ResolvedRoute<'_>,
    secret: &str,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<UnaryOutcome> {
    match route.provider.kind {
        ProviderKind::OpenAi => relay_openai_unary(req, route, secret, client, logger).await,
        ProviderKind::Gemini => relay_gemini_unary(req, route, secret, client, logger).await,
        ProviderKind::Anthropic => relay_anthropic_unary(req, route, secret, client, logger).await,
    }
}

/// Relay a streaming request, returning a stream of Anthropic SSE frames.
/// Upstream failures before the stream opens are returned as errors so the
/// caller can answer with a proper status; failures after that surface as
/// `error` events inside the stream.
pub async fn relay_stream(
    req: &MessagesRequest,
    route: &ResolvedRoute<'_>,
    secret: &str,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<SseStream> {
    match route.provider.kind {
        ProviderKind::OpenAi => {
            let url = openai_endpoint(&route.provider.base_url);
            let upstream_req = anthropic_to_openai(req, &route.model);
            logger.info(
                "relay",
                format!("POST {url} model={} (streaming)", route.model),
            );

            let response = client
                .post(&url)
                .bearer_auth(secret)
                .json(&upstream_req)
                .send()
                .await?;
            let response = require_success(response, logger).await?;

            Ok(frame_openai_stream(
                response.bytes_stream(),
                route.model.clone(),
                logger.clone(),
            ))
        }
        ProviderKind::Gemini => {
            let url = gemini_endpoint(&route.provider.base_url, &route.model, true);
            let upstream_req = anthropic_to_gemini(req);
            logger.info(
                "relay",
                format!("POST {url} model={} (streaming)", route.model),
            );

            let response = gemini_request(client, &url, route, secret)
                .json(&upstream_req)
                .send()
                .await?;
            let response = require_success(response, logger).await?;

            Ok(frame_gemini_stream(
                response.bytes_stream(),
                route.model.clone(),
                logger.clone(),
            ))
        }
        ProviderKind::Anthropic => {
            let url = anthropic_endpoint(&route.provider.base_url);
            let body = passthrough_body(req, &route.model)?;
            logger.info(
                "relay",
                format!("POST {url} model={} (passthrough streaming)", route.model),
            );

            let response = client
                .post(&url)
                .header("x-api-key", secret)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .body(body)
                .send()
                .await?;
            let response = require_success(response, logger).await?;

            Ok(frame_anthropic_stream(
                response.bytes_stream(),
                logger.clone(),
            ))
        }
    }
}

async fn relay_openai_unary(
    req: &MessagesRequest,
    route: &ResolvedRoute<'_>,
    secret: &str,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<UnaryOutcome> {
    let url = openai_endpoint(&route.provider.base_url);
    let upstream_req = anthropic_to_openai(req, &route.model);
    logger.info("relay", format!("POST {url} model={}", route.model));

    let response = client
        .post(&url)
        .bearer_auth(secret)
        .json(&upstream_req)
        .send()
        .await?;

    let status = response.status().as_u16();
    let body = response.text().await?;
    if status >= 400 {
        logger.warn("relay", format!("upstream status {status}"));
        return Err(RelayError::Upstream {
            status,
            body: truncate(&body, ERROR_BODY_LIMIT).to_string(),
        });
    }

    let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
        RelayError::upstream_shape(format!(
            "{e}. Body: {}",
            truncate(&body, ERROR_BODY_LIMIT)
        ))
    })?;

    let translated = openai_to_anthropic(&parsed);
    logger.info(
        "relay",
        format!(
            "completed: in={} out={} tokens",
            translated.usage.input_tokens, translated.usage.output_tokens
        ),
    );
    Ok(UnaryOutcome::Translated(translated))
}

async fn relay_gemini_unary(
    req: &MessagesRequest,
    route: &ResolvedRoute<'_>,
    secret: &str,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<UnaryOutcome> {
    let url = gemini_endpoint(&route.provider.base_url, &route.model, false);
    let upstream_req = anthropic_to_gemini(req);
    logger.info("relay", format!("POST {url} model={}", route.model));

    let response = gemini_request(client, &url, route, secret)
        .json(&upstream_req)
        .send()
        .await?;

    let status = response.status().as_u16();
    let body = response.text().await?;
    if status >= 400 {
        logger.warn("relay", format!("upstream status {status}"));
        return Err(RelayError::Upstream {
            status,
            body: truncate(&body, ERROR_BODY_LIMIT).to_string(),
        });
    }

    let parsed: GenerateContentResponse = serde_json::from_str(&body).map_err(|e| {
        RelayError::upstream_shape(format!(
            "{e}. Body: {}",
            truncate(&body, ERROR_BODY_LIMIT)
        ))
    })?;

    let translated = gemini_to_anthropic(&parsed, &route.model);
    logger.info(
        "relay",
        format!(
            "completed: in={} out={} tokens",
            translated.usage.input_tokens, translated.usage.output_tokens
        ),
    );
    Ok(UnaryOutcome::Translated(translated))
}

async fn relay_anthropic_unary(
    req: &MessagesRequest,
    route: &ResolvedRoute<'_>,
    secret: &str,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<UnaryOutcome> {
    let url = anthropic_endpoint(&route.provider.base_url);
    let body = passthrough_body(req, &route.model)?;
    logger.info("relay", format!("POST {url} model={} (passthrough)", route.model));

    let response = client
        .post(&url)
        .header("x-api-key", secret)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await?;

    let status = response.status().as_u16();
    let body = response.bytes().await?;
    logger.info(
        "relay",
        format!("passthrough response: status={status} len={}", body.len()),
    );
    // Passthrough forwards the upstream's own envelope and status unchanged.
    Ok(UnaryOutcome::Raw { status, body })
}

/// Serialize the request with the upstream model name substituted in; the
/// rest of the body is forwarded as received.
fn passthrough_body(req: &MessagesRequest, model: &str) -> Result<Vec<u8>> {
    let mut forwarded = req.clone();
    forwarded.model = model.to_string();
    serde_json::to_vec(&forwarded)
        .map_err(|e| RelayError::internal(format!("failed to serialize passthrough body: {e}")))
}

fn gemini_request(
    client: &reqwest::Client,
    url: &str,
    route: &ResolvedRoute<'_>,
    secret: &str,
) -> reqwest::RequestBuilder {
    // Vertex deployments authenticate with a bearer token; the public API
    // takes the key in the query string.
    if route.provider.vertex.is_some() {
        client.post(url).bearer_auth(secret)
    } else {
        client.post(url).query(&[("key", secret)])
    }
}

async fn require_success(
    response: reqwest::Response,
    logger: &SharedLogger,
) -> Result<reqwest::Response> {
    let status = response.status().as_u16();
    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        logger.warn("relay", format!("upstream status {status}"));
        return Err(RelayError::Upstream {
            status,
            body: truncate(&body, ERROR_BODY_LIMIT).to_string(),
        });
    }
    Ok(response)
}

pub fn openai_endpoint(base: &str) -> String {
    format!("{}/chat/completions", base.trim_end_matches('/'))
}

pub fn gemini_endpoint(base: &str, model: &str, streaming: bool) -> String {
    let verb = if streaming {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    format!("{}/models/{}:{}", base.trim_end_matches('/'), model, verb)
}

pub fn anthropic_endpoint(base: &str) -> String {
    format!("{}/v1/messages", base.trim_end_matches('/'))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
