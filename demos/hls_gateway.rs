//! Expose one camera channel as HLS
//!
//! Run with: cargo run --example hls_gateway HOST USER PASSWORD [CHANNEL_NO]
//!
//! Examples:
//!   cargo run --example hls_gateway 192.168.1.64 admin secret        # channel 101
//!   cargo run --example hls_gateway 192.168.1.64 admin secret 201    # channel 201
//!
//! The playlist is written under `$HLS_DIR` (default `./hls`). Serve that
//! directory with any static file server and open the printed URL, e.g.:
//!   python3 -m http.server --directory . 8000
//!   ffplay http://localhost:8000/hls/device_1/channel_1/index.m3u8
//!
//! The demo acts as one viewer: it heartbeats every few seconds and releases
//! the stream on Ctrl+C, which stops ffmpeg after the grace delay.

use std::sync::Arc;
use std::time::Duration;

use livehub::source::{
    ChannelDescriptor, ConnectionDescriptor, Credentials, RtspResolver, StaticDirectory,
};
use livehub::{ManagerConfig, StreamManager, ViewerId};

const DEVICE_ID: u64 = 1;
const CHANNEL_ID: u64 = 1;

fn print_usage() {
    eprintln!("Usage: hls_gateway HOST USER PASSWORD [CHANNEL_NO]");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  hls_gateway 192.168.1.64 admin secret");
    eprintln!("  hls_gateway 192.168.1.64 admin secret 201");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 4 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let channel_no = match args.get(4) {
        Some(n) => n.parse::<u32>()?,
        None => 101,
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("livehub=debug".parse()?)
                .add_directive("livehub::ffmpeg=info".parse()?),
        )
        .init();

    let directory = Arc::new(StaticDirectory::new());
    directory.insert(ChannelDescriptor {
        device_id: DEVICE_ID,
        channel_id: CHANNEL_ID,
        connection: ConnectionDescriptor {
            address: args[1].clone(),
            credentials: Credentials::new(args[2].clone(), args[3].clone()),
            channel_no,
            rtsp_port: None,
            active: true,
        },
        stream: None,
    });

    let manager = StreamManager::new(
        ManagerConfig::from_env(),
        directory,
        Arc::new(RtspResolver::new()),
    );
    let viewer = ViewerId::from("demo");

    println!("Starting transcoder for {}...", args[1]);
    let playback = match manager.acquire(DEVICE_ID, CHANNEL_ID, viewer.clone()).await {
        Ok(playback) => playback,
        Err(e) => {
            eprintln!("Error [{}]: {}", e.code(), e);
            manager.shutdown().await;
            std::process::exit(1);
        }
    };

    println!();
    println!("=== Play the stream ===");
    println!("URL: {}", playback.hls_url);
    println!();

    let mut ticker = tokio::time::interval(Duration::from_secs(4));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.heartbeat(&viewer);
                if let Some(stats) = manager.stats(DEVICE_ID, CHANNEL_ID) {
                    println!(
                        "Stats: state={:?} viewers={} pid={:?} uptime={:?}",
                        stats.state, stats.viewer_count, stats.pid, stats.age
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    manager.release(DEVICE_ID, CHANNEL_ID, &viewer);
    manager.shutdown().await;

    Ok(())
}
