//! Error taxonomy for the ping engine. Per-destination failures travel as
//! data on the result stream (see `Outcome::error`); only the variants here
//! that wrap a fatal socket condition terminate a stream early.

use std::fmt;
use std::net::IpAddr;

/// Errors the engine can encounter.
///
/// `Resolution`, `Timeout`, `Unreachable` and `Send` are surfaced to callers
/// as the `error` field of an `Outcome`, formatted via `Display`. `Socket` is
/// fatal: the sweep/driver that observes it stops producing further items.
#[derive(Debug)]
pub enum EngineError {
    /// A host name or address literal failed to resolve.
    Resolution { input: String, reason: String },
    /// No reply arrived for `ip` within the sweep deadline.
    Timeout { ip: IpAddr, sequence: u16 },
    /// A Destination Unreachable reply was received for `ip`.
    Unreachable { ip: IpAddr, kind: u8, code: u8 },
    /// `sendto` failed for one destination.
    Send { ip: IpAddr, source: std::io::Error },
    /// The receive path failed in a way unrelated to any single
    /// destination; fatal for the current engine run.
    Socket(std::io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Resolution { input, reason } => write!(f, "{input}: {reason}"),
            EngineError::Timeout { ip, sequence } => {
                write!(f, "{ip}: request timed out (seq={sequence})")
            }
            EngineError::Unreachable { ip, kind, code } => {
                let reason = crate::codec::unreachable_reason(*code)
                    .unwrap_or("destination unreachable (unknown code)");
                write!(f, "{ip}: {reason} (type={kind}, code={code})")
            }
            EngineError::Send { ip, source } => write!(f, "{ip}: send failed: {source}"),
            EngineError::Socket(source) => write!(f, "socket error: {source}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Send { source, .. } => Some(source),
            EngineError::Socket(source) => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(source: std::io::Error) -> Self {
        EngineError::Socket(source)
    }
}
