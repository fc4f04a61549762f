//! # Media Link
//!
//! Paced audio/video decoding, locally or streamed between two peers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              PRODUCER PC                                  │
//! │  ┌──────────────┐     ┌──────────────────────────────────────────────┐   │
//! │  │ StreamCatalog│────▶│            DecodePipeline (pipeline)          │   │
//! │  │  (catalog)   │     │  ┌───────────┐  ┌──────────┐  ┌──────────┐   │   │
//! │  └──────────────┘     │  │ Extractor │─▶│  Video   │─▶│  frames  │   │   │
//! │                       │  │  Thread   │  │  Worker  │  └──────────┘   │   │
//! │                       │  │           │─▶│  Audio   │─▶┌──────────┐   │   │
//! │                       │  │           │  │  Worker  │  │  chunks  │   │   │
//! │                       │  └─────┬─────┘  └──────────┘  └──────────┘   │   │
//! │                       │        │ mirrored packets (outbound queue)   │   │
//! │                       └────────┼─────────────────────────────────────┘   │
//! │                                ▼                                          │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │  StreamingSession (network::session) - handshake, commands, flow   │  │
//! │  └────────────────────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │  PacketTransport (network::transport) - [len|tag|payload] frames   │  │
//! │  └────────────────────────────────────────────────────────────────────┘  │
//! └────────────────────────────────┼──────────────────────────────────────────┘
//!                                  │ TCP
//!                                  ▼
//! ┌────────────────────────────────┼──────────────────────────────────────────┐
//! │                              CONSUMER PC                                  │
//! │  PacketTransport ─▶ StreamingSession ─▶ DecodePipeline (inject_packet)    │
//! │                                          ─▶ video frames / audio chunks   │
//! │                                          ─▶ Player (paced by the clock)   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod media;
pub mod network;
pub mod pipeline;
pub mod player;
pub mod protocol;
pub mod queue;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default TCP port for streaming
    pub const DEFAULT_PORT: u16 = 7400;

    /// Largest physical frame written to the socket
    pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024;

    /// Largest physical frame accepted from the socket
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Length prefix plus type tag
    pub const FRAME_HEADER_LEN: usize = 8;

    /// Unacknowledged bytes allowed in flight
    pub const DEFAULT_FLOW_WINDOW_BYTES: u64 = 4 * 1024 * 1024;

    /// Spacing between POSITION echoes (at most 10 per second)
    pub const DEFAULT_POSITION_INTERVAL_MS: u64 = 100;

    /// Worker / pump poll interval
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

    /// Enter buffering below this much buffered media
    pub const DEFAULT_LOW_WATERMARK_MS: u64 = 1_000;

    /// Leave buffering once this much media is buffered on every stream
    pub const DEFAULT_HIGH_WATERMARK_MS: u64 = 5_000;

    /// Decoded video budget
    pub const DEFAULT_VIDEO_QUEUE_MB: f64 = 128.0;

    /// Decoded audio budget
    pub const DEFAULT_AUDIO_QUEUE_MB: f64 = 16.0;

    /// Compressed packets buffered per stream
    pub const DEFAULT_PACKET_QUEUE_CAPACITY: usize = 1024;

    /// Packets mirrored for the network before the extractor waits
    pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 2048;

    /// Smallest frame queue regardless of budget
    pub const MIN_FRAME_QUEUE_CAPACITY: usize = 2;

    /// Packets read while scanning for missing stream fields
    pub const DEFAULT_MAX_PROBE_PACKETS: usize = 500;

    /// Samples per channel assumed for audio chunks when the codec does not say
    pub const DEFAULT_AUDIO_CHUNK_SAMPLES: u32 = 1024;
}
