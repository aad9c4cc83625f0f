use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the monitor, session and transport layers.
///
/// Frame-level decode problems are deliberately absent: a malformed or
/// out-of-range telemetry frame only affects the cell or module it named
/// and never aborts the session.
#[derive(Debug, Error)]
pub enum Error {
    /// An operation that needs a live link was called without one.
    #[error("not connected")]
    NotConnected,

    /// The transport could not establish the requested connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The adapter configuration sequence failed after connecting.
    #[error("adapter setup failed: {0}")]
    SetupFailed(String),

    /// The link dropped while monitoring, without a disconnect request.
    #[error("unexpected disconnect")]
    UnexpectedDisconnect,

    /// No matching response arrived before the response timeout.
    #[error("timed out waiting for response")]
    Timeout,

    /// The device answered with its negative-response pattern.
    /// Carries the raw response payload for display.
    #[error("device rejected command: {0}")]
    DeviceRejected(String),

    /// A command was issued while another was still awaiting its response.
    #[error("a command is already in flight")]
    Busy,

    /// The pending command was abandoned because the connection went away.
    #[error("command cancelled")]
    Cancelled,

    /// Transport-level failure (send, scan, characteristic discovery, ...).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}
