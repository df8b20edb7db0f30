//! Websocket sessions: worker registration and browser reload fan-out.
//!
//! A worker session walks `Opening → Connected → Closing → Closed`:
//! the region is created while opening, the name hand-off completes the
//! transition to connected, and the socket ending (either side, or a
//! network error) drives the teardown in which the session's strong device
//! handle — and with it the shared region — is dropped. The matrix only
//! ever saw weak references, so the next tick reaps what is left.
//!
//! A UI session is simpler: it subscribes to the reload broadcast and
//! forwards each event as an empty message, prompting the page to refresh.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::protocol::{RegisterTarget, Role};
use crate::server::{Device, InputDevice, OutputDevice};

use super::WebState;

/// Handle a worker registration session to completion.
pub(crate) async fn handle_worker(socket: WebSocket, target: RegisterTarget, state: Arc<WebState>) {
    debug!(?target, "worker session opening");

    // Shared-memory setup failure is fatal to this session only: close the
    // socket before any name hand-off and let the worker retry or die.
    let device = match create_device(target) {
        Ok(device) => device,
        Err(e) => {
            warn!(?target, error = %e, "shared region setup failed, dropping session");
            return;
        }
    };

    let (mut tx, mut rx) = socket.split();

    // The one and only control message: the region name the worker attaches.
    let name = device.name().to_owned();
    if let Err(e) = tx
        .send(Message::Binary(Bytes::from(name.clone().into_bytes())))
        .await
    {
        warn!(region = %name, error = %e, "name hand-off failed, dropping session");
        return;
    }

    match &device {
        Device::Input(input) => state.matrix.add_input(input),
        Device::Output(output) => state.matrix.add_output(output),
    }
    info!(region = %name, ?target, "worker session connected");

    // Workers have nothing further to say; drain and ignore until the
    // socket ends or the router shuts down.
    loop {
        tokio::select! {
            msg = rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if tx.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(region = %name, error = %e, "worker socket error");
                    break;
                }
            },
            _ = state.cancel.cancelled() => break,
        }
    }

    debug!(region = %name, "worker session closing");
    drop(device);
    info!(region = %name, "worker session closed");
}

fn create_device(target: RegisterTarget) -> anyhow::Result<Device> {
    Ok(match target.role {
        Role::Input => Device::Input(Arc::new(InputDevice::new(target.port)?)),
        Role::Output => Device::Output(Arc::new(OutputDevice::new(target.port)?)),
    })
}

/// Handle a browser UI session: forward reload events until either side
/// goes away.
pub(crate) async fn handle_ui(socket: WebSocket, state: Arc<WebState>) {
    debug!("ui session opened");
    let mut reload = state.matrix.subscribe_reload();
    let (mut tx, mut rx) = socket.split();

    loop {
        tokio::select! {
            event = reload.recv() => match event {
                Ok(()) => {
                    // Empty body; the payload is the event itself.
                    if tx.send(Message::Text("".into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "ui session lagged behind reloads");
                    // One reload covers any number of missed events.
                    if tx.send(Message::Text("".into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if tx.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            _ = state.cancel.cancelled() => break,
        }
    }

    debug!("ui session closed");
}
