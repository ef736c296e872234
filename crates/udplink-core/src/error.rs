use std::{fmt, io};

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Reasons an incoming datagram failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingErrorKind {
    /// The property bits did not name a known packet property.
    PacketProperty,
    /// The datagram was shorter than the header its property requires.
    TruncatedHeader,
    /// A fragmented packet declared `part >= total`.
    FragmentBounds,
}

impl fmt::Display for DecodingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodingErrorKind::PacketProperty => write!(f, "unknown packet property"),
            DecodingErrorKind::TruncatedHeader => write!(f, "datagram shorter than its header"),
            DecodingErrorKind::FragmentBounds => write!(f, "fragment part out of bounds"),
        }
    }
}

/// Errors surfaced by the transport.
#[derive(Debug)]
pub enum ErrorKind {
    /// An error from the underlying socket.
    IoError(io::Error),
    /// `start` was called on a manager that is already running.
    AlreadyRunning,
    /// An operation that needs a bound socket was called before `start`.
    NotRunning,
    /// An incoming datagram could not be decoded.
    DecodingError(DecodingErrorKind),
    /// A payload exceeded the maximum fragmentable size.
    PacketTooLarge(usize),
    /// A channel number at or above `MAX_CHANNELS` was requested.
    InvalidChannel(u8),
    /// The requested delivery channel or side-channel is not enabled in the
    /// configuration, or the delivery method is reserved.
    UnsupportedDelivery,
    /// The peer is not in a state that allows the operation.
    NotConnected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::IoError(e) => write!(f, "io error: {}", e),
            ErrorKind::AlreadyRunning => write!(f, "manager is already running"),
            ErrorKind::NotRunning => write!(f, "manager has not been started"),
            ErrorKind::DecodingError(kind) => write!(f, "decoding error: {}", kind),
            ErrorKind::PacketTooLarge(size) => write!(f, "packet of {} bytes exceeds limit", size),
            ErrorKind::InvalidChannel(channel) => write!(f, "invalid channel number {}", channel),
            ErrorKind::UnsupportedDelivery => write!(f, "delivery channel or feature not enabled"),
            ErrorKind::NotConnected => write!(f, "peer is not connected"),
        }
    }
}

impl std::error::Error for ErrorKind {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ErrorKind::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(inner: io::Error) -> Self {
        ErrorKind::IoError(inner)
    }
}

impl From<DecodingErrorKind> for ErrorKind {
    fn from(inner: DecodingErrorKind) -> Self {
        ErrorKind::DecodingError(inner)
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ErrorKind::IoError(a), ErrorKind::IoError(b)) => a.kind() == b.kind(),
            (ErrorKind::AlreadyRunning, ErrorKind::AlreadyRunning) => true,
            (ErrorKind::NotRunning, ErrorKind::NotRunning) => true,
            (ErrorKind::DecodingError(a), ErrorKind::DecodingError(b)) => a == b,
            (ErrorKind::PacketTooLarge(a), ErrorKind::PacketTooLarge(b)) => a == b,
            (ErrorKind::InvalidChannel(a), ErrorKind::InvalidChannel(b)) => a == b,
            (ErrorKind::UnsupportedDelivery, ErrorKind::UnsupportedDelivery) => true,
            (ErrorKind::NotConnected, ErrorKind::NotConnected) => true,
            _ => false,
        }
    }
}
