use thiserror::Error;

/// Errors raised while loading or reloading the YAML configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("structural config problem: {0}")]
    Structural(String),
}
