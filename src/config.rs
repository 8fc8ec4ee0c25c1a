//! Configuration model and validator.
//!
//! The on-disk TOML document ([`ConfigFile`]) is deserialized leniently and
//! then validated fail-fast in document order into a [`RelayConfig`]. After
//! validation every credential indirection is resolved, so request-time code
//! only distinguishes a stored secret from a client-forwarded key.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::Result;

/// Raw configuration document as it appears on disk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Client-facing read timeout in seconds; also bounds upstream calls.
    pub read_timeout: u64,
    pub write_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8082,
            read_timeout: 120,
            write_timeout: 120,
        }
    }
}

/// One `[[providers]]` table, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderEntry {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub use_vertex_auth: bool,
    #[serde(default)]
    pub vertex_project: String,
    #[serde(default)]
    pub vertex_location: String,
}

/// Validated configuration. Immutable after startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub providers: Vec<Provider>,
    /// Alias → `provider/model`. Values are guaranteed well-formed.
    pub mappings: BTreeMap<String, String>,
}

/// A validated upstream backend.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub credential: Credential,
    /// Advisory model catalog for `/v1/models`; not enforced per request.
    pub models: Vec<String>,
    pub vertex: Option<VertexAuth>,
}

impl Provider {
    pub fn is_configured(&self) -> bool {
        match &self.credential {
            Credential::Secret(secret) => !secret.is_empty(),
            Credential::ForwardClient => true,
        }
    }
}

/// Protocol family of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Anthropic,
}

impl ProviderKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "gemini" => Some(Self::Gemini),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexAuth {
    pub project: String,
    pub location: String,
}

/// Startup-resolved credential. `env:` indirections and plain literals both
/// become [`Credential::Secret`]; the literals `bypass` and `forward` defer
/// to the client's `x-api-key` header.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Secret(String),
    ForwardClient,
}

// Secrets must not leak through Debug formatting of the config.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("Secret(***)"),
            Self::ForwardClient => f.write_str("ForwardClient"),
        }
    }
}

/// A configuration rule violation. `Display` strings are operator-visible
/// and regex-matched by deployment tooling; treat them as frozen.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("invalid server port: {0}")]
    InvalidPort(u16),

    #[error("provider {0}: name is required")]
    NameRequired(usize),

    #[error("duplicate provider name: {0}")]
    DuplicateName(String),

    #[error("provider {name}: type is required")]
    TypeRequired { name: String },

    #[error("provider {name}: unknown provider type: {kind}")]
    UnknownType { name: String, kind: String },

    #[error("provider {name}: api_base_url is required")]
    BaseUrlRequired { name: String },

    #[error("provider {name}: api_key cannot be empty")]
    ApiKeyEmpty { name: String },

    #[error("provider {name}: env: mode requires an environment variable name")]
    EnvNameMissing { name: String },

    #[error("provider {name}: environment variable '{var}' is not set or is empty")]
    EnvNotSet { name: String, var: String },

    #[error("provider {name}: vertex_project is required when use_vertex_auth is true")]
    VertexProjectRequired { name: String },

    #[error("provider {name}: vertex_location is required when use_vertex_auth is true")]
    VertexLocationRequired { name: String },

    #[error("provider {name}: models list is required and must not be empty")]
    ModelsRequired { name: String },

    #[error("provider {name}: model {index}: model name cannot be empty")]
    ModelNameEmpty { name: String, index: usize },

    #[error("mapping: alias '' cannot be empty")]
    AliasEmpty,

    #[error("mapping: alias '{alias}' cannot map to empty string")]
    AliasTargetEmpty { alias: String },

    #[error("mapping: alias '{alias}' maps to invalid format '{target}' (expected 'provider/model')")]
    AliasBadFormat { alias: String, target: String },

    #[error("mapping: alias '{alias}' maps to invalid model name in '{target}'")]
    AliasBadModel { alias: String, target: String },

    #[error("mapping: alias '{alias}' references non-existent provider '{provider}'")]
    AliasUnknownProvider { alias: String, provider: String },
}

impl RelayConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(validate(file)?)
    }

    /// Resolve the config path: explicit argument, then `CONFIG_PATH`,
    /// then `config.toml` in the current directory.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var("CONFIG_PATH") {
            if !path.is_empty() {
                return Self::load(Path::new(&path));
            }
        }
        Self::load(&PathBuf::from("config.toml"))
    }

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// Validate a parsed document. Fail-fast: the first rule violation in
/// document order aborts and no partial configuration is surfaced.
pub fn validate(file: ConfigFile) -> std::result::Result<RelayConfig, ConfigError> {
    if file.server.port == 0 {
        return Err(ConfigError::InvalidPort(file.server.port));
    }

    let mut providers: Vec<Provider> = Vec::with_capacity(file.providers.len());

    for (index, entry) in file.providers.into_iter().enumerate() {
        if entry.name.is_empty() {
            return Err(ConfigError::NameRequired(index));
        }
        if providers.iter().any(|p| p.name == entry.name) {
            return Err(ConfigError::DuplicateName(entry.name));
        }
        if entry.kind.is_empty() {
            return Err(ConfigError::TypeRequired { name: entry.name });
        }
        let kind = ProviderKind::parse(&entry.kind).ok_or_else(|| ConfigError::UnknownType {
            name: entry.name.clone(),
            kind: entry.kind.clone(),
        })?;
        if entry.api_base_url.is_empty() {
            return Err(ConfigError::BaseUrlRequired { name: entry.name });
        }

        let credential = resolve_api_key(&entry.name, &entry.api_key)?;

        let vertex = if entry.use_vertex_auth {
            if entry.vertex_project.is_empty() {
                return Err(ConfigError::VertexProjectRequired { name: entry.name });
            }
            if entry.vertex_location.is_empty() {
                return Err(ConfigError::VertexLocationRequired { name: entry.name });
            }
            Some(VertexAuth {
                project: entry.vertex_project,
                location: entry.vertex_location,
            })
        } else {
            None
        };

        if entry.models.is_empty() {
            return Err(ConfigError::ModelsRequired { name: entry.name });
        }
        for (model_index, model) in entry.models.iter().enumerate() {
            if model.is_empty() {
                return Err(ConfigError::ModelNameEmpty {
                    name: entry.name,
                    index: model_index,
                });
            }
        }

        providers.push(Provider {
            name: entry.name,
            kind,
            base_url: entry.api_base_url,
            credential,
            models: entry.models,
            vertex,
        });
    }

    for (alias, target) in &file.mappings {
        if alias.is_empty() {
            return Err(ConfigError::AliasEmpty);
        }
        if target.is_empty() {
            return Err(ConfigError::AliasTargetEmpty {
                alias: alias.clone(),
            });
        }
        // Split on the first '/' only: the model part may itself contain '/'.
        let (provider, model) = match target.split_once('/') {
            Some((p, m)) if !p.is_empty() => (p, m),
            _ => {
                return Err(ConfigError::AliasBadFormat {
                    alias: alias.clone(),
                    target: target.clone(),
                })
            }
        };
        if model.is_empty() {
            return Err(ConfigError::AliasBadModel {
                alias: alias.clone(),
                target: target.clone(),
            });
        }
        if !providers.iter().any(|p| p.name == provider) {
            return Err(ConfigError::AliasUnknownProvider {
                alias: alias.clone(),
                provider: provider.to_string(),
            });
        }
    }

    Ok(RelayConfig {
        server: file.server,
        providers,
        mappings: file.mappings,
    })
}

/// Apply the credential literal grammar and resolve indirections.
///
/// `"bypass"` and `"forward"` mean the key is taken from the client per
/// request; `"env:NAME"` is resolved now and must be set and non-empty;
/// anything else non-empty is the secret itself.
fn resolve_api_key(name: &str, raw: &str) -> std::result::Result<Credential, ConfigError> {
    if raw.is_empty() {
        return Err(ConfigError::ApiKeyEmpty {
            name: name.to_string(),
        });
    }
    if raw == "bypass" || raw == "forward" {
        return Ok(Credential::ForwardClient);
    }
    if let Some(var) = raw.strip_prefix("env:") {
        if var.is_empty() {
            return Err(ConfigError::EnvNameMissing {
                name: name.to_string(),
            });
        }
        return match std::env::var(var) {
            Ok(value) if !value.is_empty() => Ok(Credential::Secret(value)),
            _ => Err(ConfigError::EnvNotSet {
                name: name.to_string(),
                var: var.to_string(),
            }),
        };
    }
    Ok(Credential::Secret(raw.to_string()))
}
