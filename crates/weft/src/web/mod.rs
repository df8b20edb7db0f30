//! The router's control plane: axum HTTP + websocket.
//!
//! Surface:
//! - `GET /` — the matrix UI, or a UI reload subscription when the request
//!   is a websocket upgrade
//! - `POST /bring_input_forward`, `POST /bring_input_backward` — body is
//!   the input name
//! - `POST /connect` — body is `"<input>&<output>&<true|false>"`
//! - websocket upgrade on `input_<port>` / `output_<port>` — worker
//!   registration; any other upgrade target is treated as a UI client
//! - anything else — 404
//!
//! CORS is permissive because the matrix page iframes worker control pages
//! served from other ports.

mod html;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{FromRequestParts, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::{StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::protocol::RegisterTarget;
use crate::server::Matrix;

/// How long a plain HTTP exchange may take. Upgraded websockets are
/// long-lived and unaffected.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state behind every control-plane handler.
pub struct WebState {
    pub matrix: Arc<Matrix>,
    /// Fires on router shutdown; sessions drain against it so their devices
    /// (and shared regions) are released before the process exits.
    pub cancel: CancellationToken,
}

/// Build the control-plane application.
pub fn app(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/bring_input_forward", post(bring_input_forward))
        .route("/bring_input_backward", post(bring_input_backward))
        .route("/connect", post(connect))
        .fallback(register_or_ui)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control plane until the state's cancellation token fires.
pub async fn serve(state: Arc<WebState>, listener: tokio::net::TcpListener) -> Result<()> {
    let cancel = state.cancel.clone();
    let addr = listener.local_addr().context("control listener address")?;
    info!(%addr, "control plane listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("control plane server")
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

/// The matrix page — or, on upgrade, a UI reload subscription (the page's
/// own script connects back to `/`).
async fn index(
    State(state): State<Arc<WebState>>,
    MaybeUpgrade(upgrade): MaybeUpgrade,
) -> Response {
    match upgrade {
        Some(upgrade) => {
            upgrade.on_upgrade(move |socket| ws::handle_ui(socket, state))
        }
        None => Html(html::render(&state.matrix.ui_snapshot())).into_response(),
    }
}

async fn bring_input_forward(State(state): State<Arc<WebState>>, body: String) -> Response {
    state.matrix.bring_input_forward(body.trim());
    StatusCode::OK.into_response()
}

async fn bring_input_backward(State(state): State<Arc<WebState>>, body: String) -> Response {
    state.matrix.bring_input_backward(body.trim());
    StatusCode::OK.into_response()
}

async fn connect(State(state): State<Arc<WebState>>, body: String) -> Response {
    match parse_connect_body(&body) {
        Some((input, output, wanted)) => {
            state.matrix.connect(input, output, wanted);
            StatusCode::OK.into_response()
        }
        None => {
            warn!(%body, "malformed connect body");
            (StatusCode::BAD_REQUEST, "cannot parse body").into_response()
        }
    }
}

/// Everything that is not a routed target: worker registrations and stray
/// UI websockets upgrade; plain requests are 404.
async fn register_or_ui(
    State(state): State<Arc<WebState>>,
    uri: Uri,
    MaybeUpgrade(upgrade): MaybeUpgrade,
) -> Response {
    let Some(upgrade) = upgrade else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match RegisterTarget::parse(uri.path()) {
        Some(target) => upgrade.on_upgrade(move |socket| ws::handle_worker(socket, target, state)),
        // Any other upgrade target is a UI client, so the reload socket
        // keeps working behind path-rewriting proxies.
        None => upgrade.on_upgrade(move |socket| ws::handle_ui(socket, state)),
    }
}

/// `"<input>&<output>&<true|false>"`, all three parts required.
fn parse_connect_body(body: &str) -> Option<(&str, &str, bool)> {
    let mut parts = body.splitn(3, '&');
    let input = parts.next()?;
    let output = parts.next()?;
    let wanted = match parts.next()? {
        "true" => true,
        "false" => false,
        _ => return None,
    };
    Some((input, output, wanted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_body_grammar() {
        assert_eq!(
            parse_connect_body("inA&outB&true"),
            Some(("inA", "outB", true))
        );
        assert_eq!(
            parse_connect_body("inA&outB&false"),
            Some(("inA", "outB", false))
        );
        assert_eq!(parse_connect_body(""), None);
        assert_eq!(parse_connect_body("inA&outB"), None);
        assert_eq!(parse_connect_body("inA&outB&yes"), None);
        assert_eq!(parse_connect_body("inA&outB&TRUE"), None);
        // Extra '&'s land in the flag field and fail there.
        assert_eq!(parse_connect_body("a&b&true&x"), None);
    }
}
