#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Tun error: {0}")]
    TunError(#[from] tidy_tuntap::error::Error),

    #[error("Port: {0} has been unexpectedly closed")]
    PortClosed(u16),

    #[error("Port: {0} already in use")]
    PortInUse(u16),

    #[error("Stream on port {0} has been closed")]
    StreamClosed(u16),

    #[error("connection to port {0} was refused or reset before establishment")]
    ConnectionRefused(u16),

    #[error("no ephemeral local port available")]
    NoEphemeralPort,

    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Error taxonomy for the send engine's public operations (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    /// Caller violated the operation's contract (e.g. an empty flag set passed to
    /// `enqueue_flags`). No state is changed.
    #[error("invalid argument")]
    Arg,
    /// The connection is not in a state that permits this operation (e.g. `write` outside
    /// {ESTABLISHED, CLOSE_WAIT, SYN_SENT, SYN_RCVD}). No state is changed.
    #[error("connection not in a valid state for this operation")]
    Conn,
    /// Send-buffer credit or queue-length cap exhausted. Sets `NAGLEMEMERR` so the next
    /// `output` overrides Nagle and drains whatever is already queued.
    #[error("send buffer or queue length exhausted")]
    Mem,
    /// Allocation failed for an unqueued control segment (empty ACK, keepalive, zero-window
    /// probe). Not retried automatically; caller may retry on the next tick.
    #[error("failed to build an unqueued control segment")]
    Buf,
}
