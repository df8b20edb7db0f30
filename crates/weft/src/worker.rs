//! Worker-side client: register with the router, attach the shared region.
//!
//! A worker opens a websocket whose target encodes its role and its own
//! control HTTP port, takes the first binary message as the name of the
//! shared region the router allocated for it, and attaches. The websocket
//! is then held open but silent — dropping it is the unregister signal, so
//! the links keep it alive for as long as they live.
//!
//! [`InputLink`] and [`OutputLink`] wrap the two sides of the triple
//! buffer. The slot-touching methods take `&mut self`, which together with
//! one-region-per-registration makes the single-writer/single-reader
//! contract structural on the worker side.

use anyhow::{bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::frame::Frame;
use crate::protocol::{register_target, Role};
use crate::region::SharedRegion;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Register as an input producer. `router` is the control endpoint
/// (`host:port`), `control_port` the worker's own HTTP port.
pub async fn register_input(router: &str, control_port: u16) -> Result<InputLink> {
    let link = RouterLink::connect(router, Role::Input, control_port).await?;
    Ok(InputLink { link })
}

/// Register as an output consumer.
pub async fn register_output(router: &str, control_port: u16) -> Result<OutputLink> {
    let link = RouterLink::connect(router, Role::Output, control_port).await?;
    Ok(OutputLink { link })
}

struct RouterLink {
    // Held open for the session's lifetime; never written after the
    // hand-off. Dropping it (and cancelling the drain task below) closes
    // the socket, which is how the router learns we are gone.
    _tx: SplitSink<Ws, Message>,
    region: SharedRegion,
    closed: CancellationToken,
    _drain_guard: DropGuard,
}

impl RouterLink {
    async fn connect(router: &str, role: Role, control_port: u16) -> Result<RouterLink> {
        let url = format!("ws://{}/{}", router, register_target(role, control_port));
        let (mut ws, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("connect to router at {}", url))?;

        let name = match ws.next().await {
            Some(Ok(Message::Binary(payload))) => {
                String::from_utf8(payload.to_vec()).context("region name is not UTF-8")?
            }
            Some(Ok(other)) => bail!("unexpected hand-off message: {:?}", other),
            Some(Err(e)) => return Err(e).context("reading region name"),
            None => bail!("router closed the socket before the name hand-off"),
        };
        let region = SharedRegion::attach(&name)
            .with_context(|| format!("attach region {:?}", name))?;
        info!(region = %name, ?role, "registered with router");

        let (tx, rx) = ws.split();
        let closed = CancellationToken::new();
        let drain_stop = CancellationToken::new();
        tokio::spawn(drain(rx, closed.clone(), drain_stop.clone()));

        Ok(RouterLink {
            _tx: tx,
            region,
            closed,
            _drain_guard: drain_stop.drop_guard(),
        })
    }
}

/// Watch the socket so the worker can notice the router going away. Stops
/// (dropping the read half, which closes the connection) when the owning
/// link is dropped.
async fn drain(mut rx: SplitStream<Ws>, closed: CancellationToken, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            msg = rx.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    debug!("router connection ended");
                    closed.cancel();
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// An input producer's handle: the sole writer of its region.
pub struct InputLink {
    link: RouterLink,
}

impl InputLink {
    /// The region name, which is also this worker's display name.
    pub fn name(&self) -> &str {
        self.link.region.name()
    }

    /// The writable frame. Fill it, then call [`publish`](Self::publish).
    pub fn frame(&mut self) -> &mut Frame {
        // Sole writer: the router only reads input regions, and the region
        // name was handed to this registration alone.
        unsafe { self.link.region.buffer().write() }
    }

    /// Hand the written frame to the router. The buffer keeps repeating the
    /// latest published frame, so write only when content changes.
    pub fn publish(&mut self) {
        self.link.region.buffer().done_writing();
    }

    /// A token that fires when the router connection ends, so the worker
    /// can exit when the router goes away.
    pub fn closed(&self) -> CancellationToken {
        self.link.closed.clone()
    }
}

/// An output consumer's handle: the sole reader of its region.
pub struct OutputLink {
    link: RouterLink,
}

impl OutputLink {
    /// The region name, which is also this worker's display name.
    pub fn name(&self) -> &str {
        self.link.region.name()
    }

    /// Whether the router has published a frame newer than the last one
    /// returned by [`latest`](Self::latest).
    pub fn has_new(&self) -> bool {
        self.link.region.buffer().has_new()
    }

    /// The most recently published frame. Advances the reader; when nothing
    /// new was published this re-reads the previous frame.
    pub fn latest(&mut self) -> &Frame {
        let buffer = self.link.region.buffer();
        buffer.about_to_read();
        // Sole reader: the router only writes output regions.
        unsafe { buffer.read() }
    }

    /// A token that fires when the router connection ends, so the worker
    /// can exit when the router goes away.
    pub fn closed(&self) -> CancellationToken {
        self.link.closed.clone()
    }
}
