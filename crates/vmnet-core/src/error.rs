use std::path::PathBuf;

/// Configuration errors. Load failures are fatal for startup; port-spec
/// failures are fatal only for the server that declared them.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid port range '{0}' (expected 'start-end' with start <= end)")]
    InvalidPortRange(String),

    #[error("public port range covers {public} ports but local range covers {local}")]
    PortRangeMismatch { public: usize, local: usize },
}
