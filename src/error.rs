//! Error types for the bhid daemon

use thiserror::Error;

/// Main error type for bhid
#[derive(Error, Debug)]
pub enum BhidError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Peer protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport errors (UTP, TCP, UNIX sockets)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Tracker round-trip errors
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing and layout errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid address: {value}")]
    InvalidAddress { value: String },

    #[error("Pidfile {path} held by running process {pid}")]
    PidfileConflict { path: String, pid: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Failed to load RSA key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("Invalid key material: {field}")]
    InvalidKey { field: String },

    #[error("Signing failed")]
    Signing,

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Unknown crypter session: {id}")]
    UnknownSession { id: String },

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,
}

/// Peer wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: i32 },

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Connection name mismatch: session bound to {bound}, got {got}")]
    NameMismatch { bound: String, got: String },

    #[error("Session {id} never bound to a connection")]
    BindTimeout { id: String },

    #[error("Rejected by peer")]
    Rejected,

    #[error("Duplicate channel id: {id}")]
    DuplicateChannel { id: String },
}

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Connect failed to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Connection reset by remote")]
    Reset,

    #[error("Connection closed")]
    Closed,

    #[error("UTP handshake timed out to {addr}")]
    HandshakeTimeout { addr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tracker round-trip outcomes surfaced to requesters
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Request timed out")]
    Timeout,

    #[error("Rejected by tracker")]
    Rejected,

    #[error("Tracker not connected")]
    NoTracker,

    #[error("Unknown tracker")]
    UnknownTracker,

    #[error("Request cancelled")]
    Cancelled,
}

impl BhidError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(ConfigError::FileNotFound { .. })
            | Self::Config(ConfigError::MissingField { .. }) => 2,
            Self::Config(ConfigError::PermissionDenied { .. }) => 3,
            Self::Crypto(CryptoError::KeyLoad { .. }) => 2,
            _ => 1,
        }
    }
}

/// Result type alias for bhid operations
pub type Result<T> = std::result::Result<T, BhidError>;
