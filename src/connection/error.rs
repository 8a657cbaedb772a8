/// Error returned when a connection or channel cannot be obtained.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {target}")]
    Connect {
        target: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to open a channel")]
    CreateChannel(#[source] anyhow::Error),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}
