//! Codec library binding
//!
//! The catalog and pipeline only talk to a codec library through these
//! traits. A backend opens containers (demuxers) and constructs decoders;
//! decoders hand back frames already converted to packed BGRA or interleaved
//! s16 PCM with microsecond timestamps.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod testsrc;

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg::FfmpegBackend;
pub use testsrc::TestPatternBackend;

use std::fmt;
use std::path::PathBuf;

use crate::error::{CodecError, OpenError};
use crate::media::{CompressedPacket, DecodedFrame, StreamDescriptor};

/// Where a container comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// A file path
    Path(PathBuf),
    /// A source name the backend resolves itself (e.g. a registered test pattern)
    Named(String),
}

impl MediaSource {
    /// Interpret a command-line argument: existing paths are files, anything else a name
    pub fn parse(arg: &str) -> Self {
        let path = PathBuf::from(arg);
        if path.exists() {
            MediaSource::Path(path)
        } else {
            MediaSource::Named(arg.to_string())
        }
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Path(path) => write!(f, "{}", path.display()),
            MediaSource::Named(name) => f.write_str(name),
        }
    }
}

/// An opened container
pub trait Demuxer: Send {
    /// Streams as declared by the container; fields the container omits are `None`
    fn streams(&self) -> &[StreamDescriptor];

    /// Container duration in microseconds, if declared
    fn duration_us(&self) -> Option<i64>;

    /// Next packet in container order, `Ok(None)` at end of stream
    fn read_packet(&mut self) -> Result<Option<CompressedPacket>, CodecError>;

    /// Seek so that the next packets start at the nearest keyframe at or before `target_us`
    fn seek(&mut self, target_us: i64) -> Result<(), CodecError>;
}

/// A stateful decoder for one stream
pub trait Decoder: Send {
    fn send_packet(&mut self, packet: &CompressedPacket) -> Result<(), CodecError>;

    /// Next decoded and converted frame, `Ok(None)` when more input is needed
    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError>;

    /// Drop buffered input/output and reset internal state
    fn flush(&mut self);
}

/// Entry point into a codec library
pub trait CodecBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open_demuxer(&self, source: &MediaSource) -> Result<Box<dyn Demuxer>, OpenError>;

    fn find_decoder(&self, stream: &StreamDescriptor) -> Result<Box<dyn Decoder>, CodecError>;
}
