use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("peer error: {0}")]
    PeerError(String),
    #[error("channel error: {0}")]
    ChannelError(String),
    #[error("storage error: {0}")]
    StorageError(String),
}
