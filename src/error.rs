use crate::connection::ConnectionId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("error binding UDP socket: {0}")]
    Bind(std::io::Error),

    #[error("error receiving: {0}")]
    Recv(std::io::Error),

    #[error("error sending UDP packet: {0}")]
    Send(std::io::Error),

    #[error("local stream error: {0}")]
    LocalStream(std::io::Error),

    #[error("error resolving remote {remote:?}: {source}")]
    Resolve {
        remote: String,
        source: std::io::Error,
    },

    #[error("remote {0:?} resolved to no addresses")]
    ResolvedNothing(String),

    #[error("no remote endpoint configured, can't open tunnels from this side")]
    NoRemoteConfigured,

    #[error("too many active connections (max {max})")]
    TooManyConnections { max: usize },

    #[error("operation requires {expected} role")]
    WrongRole { expected: &'static str },

    #[error("tunnel was shut down")]
    TunnelShutDown,

    #[error("connection {0} closed")]
    ConnectionClosed(ConnectionId),

    #[error("bug: released a buffer that was already free")]
    BugBufferAlreadyFree,

    #[error("bug: buffer on the free list was still in use")]
    BugBufferInUse,

    #[error("bug: segment of {len} bytes doesn't fit into a {capacity} byte buffer")]
    BugTooSmallBuffer { len: usize, capacity: usize },

    #[error("bug: {0}")]
    BugInvariant(&'static str),
}

impl Error {
    /// Errors that mean an internal invariant was broken, as opposed to I/O or the peer
    /// misbehaving.
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            Error::BugBufferAlreadyFree
                | Error::BugBufferInUse
                | Error::BugTooSmallBuffer { .. }
                | Error::BugInvariant(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// For options that can only be None if an internal invariant broke.
pub(crate) trait OptionContext<T>: Sized {
    fn context(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionContext<T> for Option<T> {
    fn context(self, msg: &'static str) -> Result<T> {
        self.ok_or(Error::BugInvariant(msg))
    }
}
