//! Provider API credentials
//!
//! Keys are read once at startup from a line-oriented secrets file
//! (`<provider>_key: <value>`) and shared read-only afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

const KEY_SUFFIX: &str = "_key";

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Secrets file not found. Looked at: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read secrets file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{provider} API key not found or is empty in secrets file")]
    MissingKey { provider: String },
}

/// API keys by provider name
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    keys: HashMap<String, String>,
}

impl Credentials {
    /// Load credentials from a secrets file
    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CredentialsError::NotFound(path.to_path_buf())
            } else {
                CredentialsError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let credentials = Self::parse(&content);
        tracing::debug!(
            path = %path.display(),
            providers = credentials.keys.len(),
            "Loaded credentials"
        );
        Ok(credentials)
    }

    /// Parse `<provider>_key: <value>` lines, ignoring anything else
    pub fn parse(content: &str) -> Self {
        let mut keys = HashMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let Some(provider) = name.trim().strip_suffix(KEY_SUFFIX) else {
                continue;
            };
            if provider.is_empty() {
                continue;
            }

            keys.insert(provider.to_lowercase(), unquote(value.trim()).to_string());
        }

        Self { keys }
    }

    /// Override (or add) a key, e.g. from the environment
    ///
    /// Consumes `self`: credentials are frozen once shared.
    pub fn with_key(mut self, provider: &str, api_key: Option<String>) -> Self {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.keys.insert(provider.to_lowercase(), key.trim().to_string());
        }
        self
    }

    /// Key for a provider; blank keys count as absent
    pub fn get(&self, provider: &str) -> Option<&str> {
        self.keys
            .get(provider)
            .map(String::as_str)
            .filter(|k| !k.is_empty())
    }

    pub fn require(&self, provider: &str) -> Result<&str, CredentialsError> {
        self.get(provider).ok_or_else(|| CredentialsError::MissingKey {
            provider: provider.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.keys.values().filter(|k| !k.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
