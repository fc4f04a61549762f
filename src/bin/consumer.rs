//! Media Consumer Application
//!
//! Connects to a producer, decodes the streamed packets and plays them in
//! step with the producer's clock.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_link::{
    codec::{CodecBackend, TestPatternBackend},
    config::AppConfig,
    constants::DEFAULT_PORT,
    network::{PacketTransport, SessionEvent},
    player::Player,
};

/// Decoders for whatever codecs the producer announces
#[cfg(feature = "ffmpeg")]
fn codec_backend() -> Result<Arc<dyn CodecBackend>> {
    let backend: Arc<dyn CodecBackend> =
        Arc::new(media_link::codec::FfmpegBackend::new()?.with_fallback(TestPatternBackend::shared()));
    Ok(backend)
}

#[cfg(not(feature = "ffmpeg"))]
fn codec_backend() -> Result<Arc<dyn CodecBackend>> {
    let backend: Arc<dyn CodecBackend> = TestPatternBackend::shared();
    Ok(backend)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting media consumer");

    let config = AppConfig::load_or_default();
    let producer_addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_PORT))
        .parse()
        .context("Invalid producer address")?;

    tracing::info!("Connecting to producer at {}", producer_addr);
    let transport = PacketTransport::connect(producer_addr, &config.network, None)?;

    let player = Player::consumer(Arc::new(transport), codec_backend()?, &config)?;

    let mut video_frames: u64 = 0;
    let mut audio_chunks: u64 = 0;
    let mut last_stats = Instant::now();

    loop {
        let mut disconnected = false;
        while let Some(event) = player.poll_event() {
            match event {
                SessionEvent::HandshakeComplete => {
                    tracing::info!(
                        "Handshake complete, duration {:.2}s",
                        player.duration_us().unwrap_or(0) as f64 / 1e6
                    );
                }
                SessionEvent::Disconnected => disconnected = true,
                other => tracing::info!("Session event: {:?}", other),
            }
        }
        if disconnected {
            tracing::info!("Producer disconnected");
            break;
        }

        if !player.buffering() {
            if player.video_frame().is_some() {
                video_frames += 1;
            }
            while player.audio_frame().is_some() {
                audio_chunks += 1;
            }
        }

        if last_stats.elapsed() >= Duration::from_secs(5) {
            last_stats = Instant::now();
            if let Some(session) = player.session() {
                let stats = session.stats();
                tracing::info!(
                    "Stats: position {:.2}s, {} video frames shown, {} audio chunks, {} packets injected, {} discarded, buffering {}",
                    player.position_us() as f64 / 1e6,
                    video_frames,
                    audio_chunks,
                    stats.packets_injected,
                    stats.packets_discarded,
                    player.buffering()
                );
            }
        }

        thread::sleep(Duration::from_millis(2));
    }

    player.stop();
    Ok(())
}
