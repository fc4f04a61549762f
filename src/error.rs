//! Error types for the media link

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Open error: {0}")]
    Open(#[from] OpenError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container open / stream discovery errors
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Media source not found: {0}")]
    NotFound(String),

    #[error("No decodable streams in {0}")]
    NoDecodableStreams(String),

    #[error("Container error: {0}")]
    Container(String),
}

/// Codec library errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("No decoder for codec {0}")]
    DecoderNotFound(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Demuxing failed: {0}")]
    DemuxFailed(String),

    #[error("Seek to {0}us failed")]
    SeekFailed(i64),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(i32),

    #[error("Framing violation: {0}")]
    Framing(String),

    #[error("Connection closed")]
    Disconnected,
}

/// Wire payload errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Payload truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unsupported schema version {0}")]
    UnsupportedVersion(u16),

    #[error("Unexpected message kind {0:?}")]
    UnexpectedKind(crate::protocol::MessageKind),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Decode pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline has no video or audio stream to decode")]
    NoStreams,

    #[error("Operation requires role {expected:?}, pipeline is {actual:?}")]
    WrongRole {
        expected: crate::pipeline::PlaybackRole,
        actual: crate::pipeline::PlaybackRole,
    },

    #[error("Pipeline already stopped")]
    Stopped,

    #[error("Thread spawn failed: {0}")]
    Spawn(String),

    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("No configuration directory available")]
    NoConfigDir,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
