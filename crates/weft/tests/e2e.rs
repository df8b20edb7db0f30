//! End-to-end regression suite for weft.
//!
//! Runs the real control plane on an ephemeral port and drives it the way
//! real collaborators do: workers register over genuine websockets and
//! attach the named shared-memory regions, the browser surface is exercised
//! over HTTP, and compositor passes are driven deterministically through
//! `Matrix::tick_once` instead of the timing thread.
//!
//! Run: `cargo test -p weft --test e2e`

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use weft::server::Matrix;
use weft::web::{serve, WebState};
use weft::worker;

// ── Shared helpers ───────────────────────────────────────────────────

/// Start a router control plane on an ephemeral port.
async fn start_router() -> (String, Arc<Matrix>, CancellationToken) {
    let matrix = Arc::new(Matrix::new());
    let cancel = CancellationToken::new();
    let state = Arc::new(WebState {
        matrix: Arc::clone(&matrix),
        cancel: cancel.clone(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(state, listener).await.unwrap();
    });

    (format!("127.0.0.1:{}", addr.port()), matrix, cancel)
}

async fn post(addr: &str, target: &str, body: &str) -> reqwest::StatusCode {
    reqwest::Client::new()
        .post(format!("http://{}{}", addr, target))
        .body(body.to_owned())
        .send()
        .await
        .unwrap()
        .status()
}

async fn connect_edge(addr: &str, input: &str, output: &str, wanted: bool) {
    let status = post(addr, "/connect", &format!("{}&{}&{}", input, output, wanted)).await;
    assert!(status.is_success());
}

/// Poll until `probe` returns true or the timeout elapses.
async fn eventually(what: &str, mut probe: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !probe() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Registration lands on the server session task just after the name
/// hand-off reaches the worker; wait for the matrix to catch up.
async fn wait_registered(matrix: &Matrix, inputs: usize, outputs: usize) {
    eventually("registrations to land", || {
        let view = matrix.ui_snapshot();
        view.inputs.len() == inputs && view.outputs.len() == outputs
    })
    .await;
}

// ── Registration hand-off ────────────────────────────────────────────

#[tokio::test]
async fn registration_hands_off_a_valid_region_name() {
    let (addr, matrix, _cancel) = start_router().await;

    let input = worker::register_input(&addr, 9100).await.unwrap();
    assert_eq!(input.name().len(), weft::REGION_NAME_LEN);
    assert!(input.name().bytes().all(|b| b.is_ascii_alphabetic()));

    wait_registered(&matrix, 1, 0).await;
    let view = matrix.ui_snapshot();
    assert_eq!(view.inputs[0].name, input.name());
    assert_eq!(view.inputs[0].port, 9100);
}

#[tokio::test]
async fn freshly_registered_output_reads_black_silence() {
    let (addr, matrix, _cancel) = start_router().await;

    let mut output = worker::register_output(&addr, 9200).await.unwrap();
    wait_registered(&matrix, 0, 1).await;
    assert!(output.has_new());
    let frame = output.latest();
    assert!(frame.video.iter().all(|&b| b == 0));
    assert!(frame.audio.iter().all(|&s| s == 0));
}

// ── Compositing scenarios ────────────────────────────────────────────

#[tokio::test]
async fn single_input_reaches_single_output() {
    let (addr, matrix, _cancel) = start_router().await;

    let mut input = worker::register_input(&addr, 9100).await.unwrap();
    let mut output = worker::register_output(&addr, 9200).await.unwrap();
    wait_registered(&matrix, 1, 1).await;
    connect_edge(&addr, input.name(), output.name(), true).await;

    input.frame().video[..4].copy_from_slice(&[0, 0, 255, 255]);
    input.publish();

    matrix.tick_once();

    let frame = output.latest();
    // factor = 256 - 255 = 1: dst = src + 0/256 = src, exactly.
    assert_eq!(&frame.video[..4], &[0, 0, 255, 255]);
}

#[tokio::test]
async fn disconnected_output_stays_black() {
    let (addr, matrix, _cancel) = start_router().await;

    let mut input = worker::register_input(&addr, 9100).await.unwrap();
    let mut output = worker::register_output(&addr, 9200).await.unwrap();
    wait_registered(&matrix, 1, 1).await;

    input.frame().fill_bgra(10, 20, 30, 200);
    input.publish();

    matrix.tick_once();

    let frame = output.latest();
    assert!(frame.video.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn layering_follows_display_order() {
    let (addr, matrix, _cancel) = start_router().await;

    let mut i1 = worker::register_input(&addr, 9101).await.unwrap();
    let mut i2 = worker::register_input(&addr, 9102).await.unwrap();
    let mut output = worker::register_output(&addr, 9200).await.unwrap();
    wait_registered(&matrix, 2, 1).await;
    connect_edge(&addr, i1.name(), output.name(), true).await;
    connect_edge(&addr, i2.name(), output.name(), true).await;

    i1.frame().video[..4].copy_from_slice(&[100, 100, 100, 255]);
    i1.publish();
    // Transparent in pre-multiplied form: all channels zero.
    i2.frame().video[..4].copy_from_slice(&[0, 0, 0, 0]);
    i2.publish();

    matrix.tick_once();
    // The transparent top layer contributes dst * 256/256 = dst.
    assert_eq!(&output.latest().video[..4], &[100, 100, 100, 255]);

    // Reversing the order changes nothing while the second input stays
    // transparent.
    let status = post(&addr, "/bring_input_forward", i1.name()).await;
    assert!(status.is_success());
    matrix.tick_once();
    assert_eq!(&output.latest().video[..4], &[100, 100, 100, 255]);

    // Restore the order and make the later input opaque: it overwrites the
    // earlier one (exactly, for channel values < 256).
    let status = post(&addr, "/bring_input_backward", i1.name()).await;
    assert!(status.is_success());
    i2.frame().video[..4].copy_from_slice(&[200, 200, 200, 255]);
    i2.publish();
    matrix.tick_once();
    assert_eq!(&output.latest().video[..4], &[200, 200, 200, 255]);
}

#[tokio::test]
async fn audio_sums_across_connected_inputs() {
    let (addr, matrix, _cancel) = start_router().await;

    let mut i1 = worker::register_input(&addr, 9101).await.unwrap();
    let mut i2 = worker::register_input(&addr, 9102).await.unwrap();
    let mut output = worker::register_output(&addr, 9200).await.unwrap();
    wait_registered(&matrix, 2, 1).await;
    connect_edge(&addr, i1.name(), output.name(), true).await;
    connect_edge(&addr, i2.name(), output.name(), true).await;

    i1.frame().audio[0] = 0x1000_0000;
    i1.publish();
    i2.frame().audio[0] = 0x1000_0000;
    i2.publish();

    matrix.tick_once();

    assert_eq!(output.latest().audio[0], 0x2000_0000);
}

#[tokio::test]
async fn input_republishing_within_a_tick_shows_only_the_latest() {
    let (addr, matrix, _cancel) = start_router().await;

    let mut input = worker::register_input(&addr, 9100).await.unwrap();
    let mut output = worker::register_output(&addr, 9200).await.unwrap();
    wait_registered(&matrix, 1, 1).await;
    connect_edge(&addr, input.name(), output.name(), true).await;

    for value in [0x11_u8, 0x22, 0x33] {
        input.frame().video[..4].copy_from_slice(&[value, value, value, 255]);
        input.publish();
    }

    matrix.tick_once();

    assert_eq!(&output.latest().video[..4], &[0x33, 0x33, 0x33, 255]);
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn closed_input_is_reaped_and_its_output_goes_black() {
    let (addr, matrix, _cancel) = start_router().await;

    let mut input = worker::register_input(&addr, 9100).await.unwrap();
    let mut output = worker::register_output(&addr, 9200).await.unwrap();
    wait_registered(&matrix, 1, 1).await;
    connect_edge(&addr, input.name(), output.name(), true).await;

    input.frame().fill_bgra(1, 2, 3, 255);
    input.publish();
    matrix.tick_once();
    assert_eq!(&output.latest().video[..4], &[1, 2, 3, 255]);

    // Dropping the link closes the websocket: that is the only unregister
    // signal there is.
    drop(input);
    eventually("input to be reaped", || matrix.ui_snapshot().inputs.is_empty()).await;

    matrix.tick_once();
    assert!(output.latest().video.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn worker_sees_router_shutdown() {
    let (addr, _matrix, cancel) = start_router().await;

    let input = worker::register_input(&addr, 9100).await.unwrap();
    let closed = input.closed();

    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(2), closed.cancelled())
        .await
        .expect("worker should observe the router going away");
}

// ── Browser surface ──────────────────────────────────────────────────

#[tokio::test]
async fn matrix_page_lists_devices_and_connections() {
    let (addr, matrix, _cancel) = start_router().await;

    let input = worker::register_input(&addr, 9100).await.unwrap();
    let output = worker::register_output(&addr, 9200).await.unwrap();
    wait_registered(&matrix, 1, 1).await;
    connect_edge(&addr, input.name(), output.name(), true).await;

    let page = reqwest::get(format!("http://{}/", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(page.contains(input.name()));
    assert!(page.contains(output.name()));
    assert!(page.contains(":9100"));
    assert!(page.contains(":9200"));
    assert!(page.contains("checked"));
}

#[tokio::test]
async fn ui_websocket_receives_reload_on_mutation() {
    let (addr, matrix, _cancel) = start_router().await;

    let input = worker::register_input(&addr, 9100).await.unwrap();
    let output = worker::register_output(&addr, 9200).await.unwrap();
    wait_registered(&matrix, 1, 1).await;

    // The matrix page connects its reload socket to the root target.
    let (mut ui, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
        .await
        .unwrap();

    connect_edge(&addr, input.name(), output.name(), true).await;

    let msg = tokio::time::timeout(Duration::from_secs(2), ui.next())
        .await
        .expect("expected a reload broadcast")
        .unwrap()
        .unwrap();
    match msg {
        tungstenite::Message::Text(body) => assert!(body.is_empty()),
        other => panic!("expected an empty text reload, got {:?}", other),
    }

    ui.send(tungstenite::Message::Close(None)).await.ok();
}

#[tokio::test]
async fn http_error_paths() {
    let (addr, _matrix, _cancel) = start_router().await;

    // Unknown plain target: 404.
    let status = reqwest::get(format!("http://{}/no_such_page", addr))
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

    // Malformed connect body: 400 with a short reason.
    let response = reqwest::Client::new()
        .post(format!("http://{}/connect", addr))
        .body("not a connect body")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(response.text().await.unwrap(), "cannot parse body");

    // Reordering an unknown input is logged, not an error.
    let status = post(&addr, "/bring_input_forward", "NoSuchInput").await;
    assert!(status.is_success());
}
