//! Model and credential resolution.
//!
//! Maps a client-supplied model string to a configured backend and decides
//! which key to present upstream. Resolution order: an explicit
//! `provider/model` identifier wins, then the alias table, then failure.

use axum::http::HeaderMap;

use crate::config::{Credential, Provider, RelayConfig};
use crate::error::{RelayError, Result};

/// The outcome of routing one request: which backend to call and the model
/// name to send it. Borrows from the immutable configuration.
#[derive(Debug, Clone)]
pub struct ResolvedRoute<'a> {
    pub provider: &'a Provider,
    pub model: String,
}

/// Resolve a client model string into a route.
///
/// A string containing `/` is split at the first `/` into provider and
/// model (so `a/b/c` addresses provider `a`, model `b/c`). Bare strings are
/// looked up in the alias table, whose values are guaranteed well-formed by
/// config validation. The provider's model catalog is deliberately not
/// consulted: it feeds `/v1/models`, not request gating.
pub fn resolve_route<'a>(config: &'a RelayConfig, model: &str) -> Result<ResolvedRoute<'a>> {
    if let Some((provider_name, upstream_model)) = model.split_once('/') {
        let provider = config.provider(provider_name).ok_or_else(|| {
            RelayError::bad_request(format!(
                "unknown provider '{provider_name}' in model '{model}'"
            ))
        })?;
        return Ok(ResolvedRoute {
            provider,
            model: upstream_model.to_string(),
        });
    }

    if let Some(target) = config.mappings.get(model) {
        return resolve_route(config, target);
    }

    Err(RelayError::bad_request(format!(
        "model '{model}' does not match any provider or alias"
    )))
}

/// Resolve the concrete secret to send upstream for this call.
///
/// Startup-resolved credentials are used as stored. Forward-client backends
/// read the caller's `x-api-key` header; a missing or empty value fails the
/// request before anything is sent upstream. The returned secret must never
/// be written to logs.
pub fn resolve_credential(route: &ResolvedRoute<'_>, headers: &HeaderMap) -> Result<String> {
    match &route.provider.credential {
        Credential::Secret(secret) => Ok(secret.clone()),
        Credential::ForwardClient => {
            let key = headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if key.is_empty() {
                return Err(RelayError::unauthorized(format!(
                    "provider '{}' requires an x-api-key header from the client",
                    route.provider.name
                )));
            }
            Ok(key.to_string())
        }
    }
}
