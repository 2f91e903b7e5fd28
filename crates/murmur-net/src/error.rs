use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame codec error: {0}")]
    Codec(String),

    #[error("Frame of {0} bytes exceeds the link limit")]
    FrameTooLarge(usize),

    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Connection attempt timed out")]
    Timeout,

    /// No live link to the peer, or the link dropped before the remote
    /// acknowledged the frame.
    #[error("Transport unavailable")]
    TransportUnavailable,

    /// The channel was closed while the operation was pending.
    #[error("Channel closed")]
    Cancelled,
}
