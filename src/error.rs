use std::{io, net::SocketAddr};

/// Failure to bring the listening socket up. Nothing is left bound when this is returned.
#[derive(Debug, derive_more::Display)]
pub enum StartupError {
    #[display(fmt = "Error starting server: cannot resolve {}: {}", host, source)]
    Resolve { host: String, source: io::Error },
    #[display(fmt = "Error starting server: {} has no IPv4 address", host)]
    NoIpv4Address { host: String },
    #[display(fmt = "Error starting server: cannot listen on {}: {}", addr, source)]
    Bind { addr: SocketAddr, source: io::Error },
    #[display(fmt = "Error starting server: already started")]
    AlreadyStarted,
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Resolve { source, .. } | StartupError::Bind { source, .. } => Some(source),
            StartupError::NoIpv4Address { .. } | StartupError::AlreadyStarted => None,
        }
    }
}

/// Why a single connection stopped being served.
#[derive(Debug, derive_more::Display)]
pub enum ConnectionError {
    #[display(fmt = "client disconnected: {}", _0)]
    ExpectedDisconnect(io::Error),
    #[display(fmt = "unexpected I/O error: {}", _0)]
    Unexpected(io::Error),
}

impl ConnectionError {
    pub fn is_expected(&self) -> bool {
        matches!(self, ConnectionError::ExpectedDisconnect(_))
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                ConnectionError::ExpectedDisconnect(err)
            }
            _ => ConnectionError::Unexpected(err),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::ExpectedDisconnect(err) | ConnectionError::Unexpected(err) => Some(err),
        }
    }
}
