//! Media Producer Application
//!
//! Opens a media source, waits for a consumer to connect, then plays the
//! source locally while streaming its packets to the consumer over TCP.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_link::{
    catalog::Catalog,
    codec::{testsrc::DEFAULT_SOURCE, CodecBackend, MediaSource, TestPatternBackend},
    config::AppConfig,
    network::{listen, PacketTransport, SessionEvent},
    player::Player,
};

/// Real files go through FFmpeg when it is built in; test patterns always work
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

    tracing::info!("Starting media producer");

    let config = AppConfig::load_or_default();
    let mut args = std::env::args().skip(1);
    let source = MediaSource::parse(&args.next().unwrap_or_else(|| DEFAULT_SOURCE.to_string()));
    let bind_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| format!("{}:{}", config.network.bind_address, config.network.port))
        .parse()
        .context("Invalid bind address")?;

    let backend = codec_backend()?;
    let catalog = Catalog::open(backend, source.clone(), &config.catalog)
        .with_context(|| format!("Failed to open {}", source))?;

    println!("\n=== Media Catalog ===");
    println!("{}", serde_json::to_string_pretty(&catalog.summary())?);
    println!();

    let listener = listen(bind_addr)?;
    tracing::info!("Waiting for consumer on {}", bind_addr);

    let transport = PacketTransport::accept(
        &listener,
        &config.network,
        Some(Box::new(|peer| tracing::warn!("Consumer {} disconnected", peer))),
    )?;
    tracing::info!("Consumer connected from {:?}", transport.remote_addr());

    let player = Player::producer(&catalog, Arc::new(transport), &config)?;
    player.play();

    let mut video_frames: u64 = 0;
    let mut audio_chunks: u64 = 0;
    let mut last_stats = Instant::now();

    tracing::info!("Starting playback loop - press Ctrl+C to stop");

    loop {
        while let Some(event) = player.poll_event() {
            tracing::info!("Session event: {:?}", event);
            if event == SessionEvent::Disconnected {
                tracing::info!("Continuing playback offline");
            }
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
            if let Some(pipeline) = player.pipeline() {
                let stats = pipeline.stats();
                tracing::info!(
                    "Stats: position {:.2}s, {} video frames shown ({} dropped), {} audio chunks, {} packets read, {} decode errors",
                    player.position_us() as f64 / 1e6,
                    video_frames,
                    player.dropped_frames(),
                    audio_chunks,
                    stats.packets_read,
                    stats.decode_errors
                );
            }
            if let Some(session) = player.session() {
                let stats = session.stats();
                tracing::info!(
                    "Session: {} packets sent, {} bytes in flight, {:.1} KB on the wire",
                    stats.packets_sent,
                    stats.bytes_in_flight,
                    stats.transport.bytes_sent as f64 / 1024.0
                );
            }
        }

        let finished = player.pipeline().map_or(true, |p| {
            p.eof() && p.peek_video_timestamp().is_none() && p.peek_audio_timestamp().is_none()
        });
        if finished {
            tracing::info!("End of media reached");
            break;
        }

        thread::sleep(Duration::from_millis(2));
    }

    player.stop();
    Ok(())
}
