//! weft-colour — a solid-colour input worker.
//!
//! Registers with the router as an input, serves a one-control colour
//! picker on its own ephemeral HTTP port (the matrix UI embeds it in an
//! iframe), and repaints its frame whenever the colour changes. The triple
//! buffer repeats the last published frame, so there is nothing to do per
//! tick.
//!
//! ## Usage
//!
//! ```bash
//! # Register with a local router, starting out a pleasant blue
//! weft-colour
//!
//! # Initial colour as the one positional argument
//! weft-colour '#ff8800'
//!
//! # Router elsewhere
//! WEFT_ROUTER=10.1.2.3:8080 weft-colour
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::extract::{FromRequestParts, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{broadcast, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use weft::worker::{self, InputLink};

struct AppState {
    colour: Mutex<String>,
    link: Mutex<InputLink>,
    reload: broadcast::Sender<()>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let colour = std::env::args().nth(1).unwrap_or_else(|| "#abcdef".into());
    parse_colour(&colour).context("initial colour")?;

    let router = std::env::var("WEFT_ROUTER").unwrap_or_else(|_| "127.0.0.1:8080".into());

    // Bind first: the registration target carries our control port.
    let listener = tokio::net::TcpListener::bind("0.0.0.0:0")
        .await
        .context("bind control port")?;
    let port = listener.local_addr().context("control port address")?.port();

    let mut link = worker::register_input(&router, port).await?;
    paint(&mut link, &colour)?;
    info!(name = %link.name(), %colour, "colour source up");

    let closed = link.closed();
    let (reload, _) = broadcast::channel(4);
    let state = Arc::new(AppState {
        colour: Mutex::new(colour),
        link: Mutex::new(link),
        reload,
    });

    let app = Router::new()
        .route("/", get(index))
        .route("/colour", post(set_colour))
        .layer(CorsLayer::permissive())
        .with_state(state);

    tokio::select! {
        result = async { axum::serve(listener, app).await } => result.context("control server")?,
        _ = closed.cancelled() => {
            info!("router went away, exiting");
        }
    }
    Ok(())
}

/// Fill the whole frame with `#rrggbb` at full alpha and publish it.
fn paint(link: &mut InputLink, colour: &str) -> Result<()> {
    let (r, g, b) = parse_colour(colour)?;
    link.frame().fill_bgra(b, g, r, 255);
    link.publish();
    Ok(())
}

fn parse_colour(colour: &str) -> Result<(u8, u8, u8)> {
    let hex = match colour.strip_prefix('#') {
        Some(hex) if hex.len() == 6 && hex.is_ascii() => hex,
        _ => bail!("colour must look like #rrggbb, got {:?}", colour),
    };
    let channel = |range| {
        u8::from_str_radix(&hex[range], 16)
            .with_context(|| format!("bad colour channel in {:?}", colour))
    };
    Ok((channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

/// `Option<WebSocketUpgrade>` as an extractor: succeeds with `None` when the
/// request isn't an upgrade, instead of rejecting.
struct MaybeUpgrade(Option<WebSocketUpgrade>);

impl<S> FromRequestParts<S> for MaybeUpgrade
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeUpgrade(
            WebSocketUpgrade::from_request_parts(parts, state).await.ok(),
        ))
    }
}

/// The picker page — or, on upgrade, a reload subscription for it.
async fn index(
    State(state): State<Arc<AppState>>,
    MaybeUpgrade(upgrade): MaybeUpgrade,
) -> Response {
    if let Some(upgrade) = upgrade {
        return upgrade.on_upgrade(move |socket| reload_session(socket, state));
    }
    let colour = state.colour.lock().await.clone();
    Html(picker_page(&colour)).into_response()
}

async fn set_colour(State(state): State<Arc<AppState>>, body: String) -> Response {
    let colour = body.trim().to_owned();
    if let Err(e) = parse_colour(&colour) {
        warn!(error = %e, "rejecting colour");
        return (StatusCode::BAD_REQUEST, "cannot parse colour").into_response();
    }

    let mut link = state.link.lock().await;
    if let Err(e) = paint(&mut link, &colour) {
        warn!(error = %e, "repaint failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    drop(link);

    *state.colour.lock().await = colour;
    let _ = state.reload.send(());
    StatusCode::OK.into_response()
}

async fn reload_session(mut socket: axum::extract::ws::WebSocket, state: Arc<AppState>) {
    let mut reload = state.reload.subscribe();
    while reload.recv().await.is_ok() {
        if socket
            .send(axum::extract::ws::Message::Text("".into()))
            .await
            .is_err()
        {
            break;
        }
    }
}

fn picker_page(colour: &str) -> String {
    format!(
        r#"<html>
  <head>
  </head>
  <body>
    Colour
    <input
      type="color"
      onchange="fetch('/colour', {{method: 'POST', body: event.target.value}})"
      value="{colour}"
    >
    </input>
    <script>
      let ws;

      function open_ws() {{
        ws = new WebSocket(`ws://${{window.location.host}}`);
        ws.onopen = function(ev) {{}};
        ws.onclose = function(ev) {{
          console.log(`Close: ${{ev}}`);
        }};
        ws.onmessage = function(ev) {{
          window.location.reload();
        }};
        ws.onerror = function(ev) {{
          console.log(`Error: ${{ev}}`);
          open_ws();
        }};
      }}

      open_ws();
    </script>
  </body>
</html>
"#
    )
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("weft=info".parse().unwrap()),
        )
        .init();
}
