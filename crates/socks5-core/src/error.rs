//! Error kinds surfaced by the core, one variant per failure mode a session
//! can hit.
//!
//! A session-local error either carries enough information to synthesize a
//! SOCKS reply (`to_reply_code`) or is silent (returns `None`, meaning the
//! session is simply dropped). Either way, a session-local error never
//! propagates past the session's own task.

use std::backtrace::Backtrace;

use snafu::{IntoError, Snafu};

use crate::types::ReplyCode;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// EOF or reset from client or upstream.
    PeerClosed { backtrace: Backtrace },

    /// Malformed greeting, bad version, or unexpected framing.
    #[snafu(display("protocol violation: {reason}"))]
    ProtocolViolation { reason: String, backtrace: Backtrace },

    /// No method in the client's list is in the configured acceptable set.
    UnsupportedMethod { backtrace: Backtrace },

    /// Username/password subnegotiation mismatch.
    AuthFailed { backtrace: Backtrace },

    /// BIND, or a CMD byte outside {CONNECT, BIND, UDP ASSOCIATE}.
    UnsupportedCommand { backtrace: Backtrace },

    /// ATYP outside {IPv4, Domain, IPv6}.
    UnsupportedAddressType { backtrace: Backtrace },

    /// DNS resolution returned no usable endpoint.
    HostUnreachable { backtrace: Backtrace },

    /// Every resolved endpoint refused the CONNECT attempt.
    NetworkUnreachable { backtrace: Backtrace },

    /// Connect succeeded but the local endpoint could not be queried
    /// afterwards, or the upstream reset the connection.
    ConnRefused { source: std::io::Error, backtrace: Backtrace },

    /// The idle deadline expired.
    Timeout { backtrace: Backtrace },

    /// A UDP datagram's FRAG field was non-zero.
    UdpFragNotSupported { backtrace: Backtrace },

    /// A UDP datagram's header did not fit in the bytes received.
    UdpHeaderMalformed { backtrace: Backtrace },

    /// Any other I/O failure, not otherwise classified.
    Io { source: std::io::Error, backtrace: Backtrace },
}

impl Error {
    /// The REP octet this error maps to, when it is a TCP-request-stage
    /// error that should produce a reply frame before closing. `None` means
    /// the session is terminated silently (or via a different frame shape,
    /// as for `UnsupportedMethod`/`AuthFailed`, which the caller handles
    /// directly).
    pub fn to_reply_code(&self) -> Option<ReplyCode> {
        match self {
            Error::UnsupportedCommand { .. } => Some(ReplyCode::CommandNotSupported),
            Error::UnsupportedAddressType { .. } => Some(ReplyCode::AddrTypeNotSupported),
            Error::HostUnreachable { .. } => Some(ReplyCode::HostUnreachable),
            Error::NetworkUnreachable { .. } => Some(ReplyCode::NetworkUnreachable),
            Error::ConnRefused { .. } => Some(ReplyCode::ConnRefused),
            _ => None,
        }
    }

    /// `true` for errors that should be logged at debug level rather than
    /// warn — the "ordinary" ways a session ends.
    pub fn is_quiet(&self) -> bool {
        matches!(self, Error::PeerClosed { .. } | Error::Timeout { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match source.kind() {
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe => PeerClosedSnafu.build(),
            _ => IoSnafu.into_error(source),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
