use orion_host::{ConfigError, HostError, LoadError};

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<LoadError> for CliError {
    fn from(err: LoadError) -> Self {
        CliError::Host(err.into())
    }
}
