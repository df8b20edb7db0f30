//! weft-monitor — an output worker that watches instead of displaying.
//!
//! Registers with the router as an output and polls the composited frames
//! at the frame period, logging picture and audio activity at a steady
//! cadence. Stands in for hardware playout (SDI, NDI) where none is
//! attached, and doubles as a debugging tap: its control page shows the
//! latest stats and is embedded in the matrix UI like any other worker.
//!
//! ## Usage
//!
//! ```bash
//! weft-monitor
//!
//! # Router elsewhere
//! WEFT_ROUTER=10.1.2.3:8080 weft-monitor
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use weft::{Frame, AUDIO_SAMPLES, VIDEO_BYTES};

const POLL_PERIOD: Duration = Duration::from_millis(40);
const LOG_EVERY: u32 = 25; // once a second at the frame period

#[derive(Clone, Copy, Default)]
struct FrameStats {
    /// Fraction of pixels that are not pure black, in percent
    lit_percent: f64,
    /// RMS audio level in dBFS
    rms_db: f64,
    frames_seen: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let router = std::env::var("WEFT_ROUTER").unwrap_or_else(|_| "127.0.0.1:8080".into());

    let listener = tokio::net::TcpListener::bind("0.0.0.0:0")
        .await
        .context("bind control port")?;
    let port = listener.local_addr().context("control port address")?.port();

    let mut link = weft::worker::register_output(&router, port)
        .await
        .context("register with router")?;
    info!(name = %link.name(), "monitor up");

    let stats = Arc::new(Mutex::new(FrameStats::default()));

    let app = Router::new()
        .route("/", get(status_page))
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&stats));
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "control server error");
        }
    });

    let closed = link.closed();
    let mut ticker = tokio::time::interval(POLL_PERIOD);
    let mut since_log = 0u32;
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                info!("router went away, exiting");
                break;
            }
            _ = ticker.tick() => {
                if !link.has_new() {
                    continue;
                }
                let frame = link.latest();
                let snapshot = {
                    let mut stats = stats.lock().unwrap();
                    stats.lit_percent = lit_percent(frame);
                    stats.rms_db = audio_rms_db(frame);
                    stats.frames_seen += 1;
                    *stats
                };
                since_log += 1;
                if since_log >= LOG_EVERY {
                    since_log = 0;
                    info!(
                        frames = snapshot.frames_seen,
                        lit = %format!("{:.1}%", snapshot.lit_percent),
                        rms = %format!("{:.1} dB", snapshot.rms_db),
                        "monitoring"
                    );
                }
            }
        }
    }

    server.abort();
    Ok(())
}

fn lit_percent(frame: &Frame) -> f64 {
    let lit = frame
        .video
        .chunks_exact(4)
        .filter(|px| px[0] != 0 || px[1] != 0 || px[2] != 0)
        .count();
    lit as f64 * 100.0 / (VIDEO_BYTES / 4) as f64
}

/// RMS level of the interleaved samples in dBFS, floored at -60.
fn audio_rms_db(frame: &Frame) -> f64 {
    let mut sum_sq = 0.0f64;
    for &sample in frame.audio.iter() {
        let s = sample as f64;
        sum_sq += s * s;
    }
    let rms = (sum_sq / AUDIO_SAMPLES as f64).sqrt();
    if rms <= 0.0 {
        return -60.0;
    }
    let db = 20.0 * (rms / i32::MAX as f64).log10();
    db.max(-60.0)
}

async fn status_page(State(stats): State<Arc<Mutex<FrameStats>>>) -> Html<String> {
    let stats = *stats.lock().unwrap();
    Html(format!(
        r#"<html>
  <body>
    Monitor<br>
    frames: {}<br>
    lit: {:.1}%<br>
    audio: {:.1} dB
  </body>
</html>
"#,
        stats.frames_seen, stats.lit_percent, stats.rms_db
    ))
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("weft=info".parse().unwrap()),
        )
        .init();
}
