/// Network failures while loading a widget's data.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Upstream answered with a non-2xx status.
    #[error("HTTP {status} {reason}")]
    Status { status: u16, reason: String },

    /// The request never produced a response.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The same-origin proxy could not fetch the URL either.
    #[error("Proxy fetch failed {status}: {body}")]
    Proxy { status: u16, body: String },
}

impl FetchError {
    pub fn status(status: reqwest::StatusCode) -> Self {
        Self::Status {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
        }
    }
}

/// Widget configuration that blocks fetching altogether.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("No API URL configured")]
    MissingApiUrl,
}

/// A rejected import file. State is left untouched when this is returned.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("invalid dashboard file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not persist imported dashboard: {0:#}")]
    Persist(anyhow::Error),
}

impl From<anyhow::Error> for ImportError {
    fn from(e: anyhow::Error) -> Self {
        Self::Persist(e)
    }
}

/// Why a widget has no fresh data.
#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}
