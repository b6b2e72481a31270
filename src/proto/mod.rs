//! Wire protocol definitions
//!
//! Three protobuf catalogs share one framing scheme (4-byte big-endian
//! length prefix): `tracker` for the daemon↔tracker TCP link, `daemon` for
//! the CLI↔daemon UNIX socket, and `peer` for the two-layer session
//! protocol between daemons.

pub mod daemon;
pub mod framing;
pub mod peer;
pub mod tracker;

pub use framing::{encode_frame, read_frame, write_frame, FrameBuffer};

/// Outcome enum shared by every request/response pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageResult {
    Accepted = 0,
    Rejected = 1,
    AlreadyRegistered = 2,
    NotRegistered = 3,
    InvalidPath = 4,
    PathNotFound = 5,
    InvalidAddress = 6,
    DaemonNotFound = 7,
    AlreadyConnected = 8,
    NotConfirmed = 9,
    NotFound = 10,
    Timeout = 11,
    NoTracker = 12,
}

impl MessageResult {
    /// Human phrase for CLI error output
    pub fn phrase(self) -> &'static str {
        match self {
            MessageResult::Accepted => "accepted",
            MessageResult::Rejected => "request rejected",
            MessageResult::AlreadyRegistered => "already registered",
            MessageResult::NotRegistered => "daemon is not registered",
            MessageResult::InvalidPath => "invalid path",
            MessageResult::PathNotFound => "path not found",
            MessageResult::InvalidAddress => "invalid address",
            MessageResult::DaemonNotFound => "daemon not found",
            MessageResult::AlreadyConnected => "already connected",
            MessageResult::NotConfirmed => "account not confirmed",
            MessageResult::NotFound => "not found",
            MessageResult::Timeout => "request timed out",
            MessageResult::NoTracker => "tracker is not available",
        }
    }
}

impl From<crate::error::TrackerError> for MessageResult {
    fn from(err: crate::error::TrackerError) -> Self {
        use crate::error::TrackerError;
        match err {
            TrackerError::Timeout => MessageResult::Timeout,
            TrackerError::Cancelled => MessageResult::Timeout,
            TrackerError::Rejected => MessageResult::Rejected,
            TrackerError::NoTracker | TrackerError::UnknownTracker => MessageResult::NoTracker,
        }
    }
}
