//! Device registry and connection matrix.
//!
//! Ownership is deliberately one-way: the websocket session that registered
//! a worker holds the only strong [`Arc`] to its device (and through it the
//! shared region). The matrix and the per-input connection edges hold weak
//! references exclusively, so a crashed or disconnected worker decays out of
//! the topology without any explicit teardown path — the compositor tick
//! reaps expired entries on its next pass.
//!
//! Input order is meaningful: inputs composite back-to-front onto every
//! connected output, so a later input paints over an earlier one. Outputs
//! are unordered.

mod blend;
mod tick;

pub use blend::alpha_over;
pub use tick::{spawn_tick, TICK_PERIOD};

use std::sync::{Arc, Mutex, Weak};

use anyhow::Result;
use tokio::sync::broadcast;

use crate::frame::Frame;
use crate::region::SharedRegion;

/// A registered output: the router writes composited frames into its region.
pub struct OutputDevice {
    region: SharedRegion,
    port: u16,
}

impl OutputDevice {
    /// Create the output's shared region. `port` is the worker's own control
    /// HTTP port, shown in the matrix UI.
    pub fn new(port: u16) -> Result<OutputDevice> {
        Ok(OutputDevice {
            region: SharedRegion::create()?,
            port,
        })
    }

    /// The device's display name, equal to its region name.
    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    // The router's tick thread is the sole writer of an output region (the
    // worker on the far side only reads), which is what makes the unsafe
    // slot access below sound.

    pub(crate) fn clear_frame(&self) {
        unsafe { self.region.buffer().write() }.clear();
    }

    pub(crate) fn blend_from(&self, src: &Frame) {
        blend::alpha_over(unsafe { self.region.buffer().write() }, src);
    }

    pub(crate) fn publish(&self) {
        self.region.buffer().done_writing();
    }
}

/// A registered input: a worker writes frames into its region and the
/// router composites them onto the input's connected outputs.
pub struct InputDevice {
    region: SharedRegion,
    port: u16,
    /// Connected outputs, weakly held; order is irrelevant here.
    outputs: Mutex<Vec<Weak<OutputDevice>>>,
}

impl InputDevice {
    /// Create the input's shared region. `port` is the worker's own control
    /// HTTP port, shown in the matrix UI.
    pub fn new(port: u16) -> Result<InputDevice> {
        Ok(InputDevice {
            region: SharedRegion::create()?,
            port,
            outputs: Mutex::new(Vec::new()),
        })
    }

    /// The device's display name, equal to its region name.
    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn has_output(&self, output: &Arc<OutputDevice>) -> bool {
        self.outputs
            .lock()
            .unwrap()
            .iter()
            .any(|candidate| candidate.upgrade().is_some_and(|c| Arc::ptr_eq(&c, output)))
    }

    /// Connect this input to `output`. Idempotent.
    pub(crate) fn add_output(&self, output: &Arc<OutputDevice>) {
        let mut outputs = self.outputs.lock().unwrap();
        if !outputs
            .iter()
            .any(|candidate| candidate.upgrade().is_some_and(|c| Arc::ptr_eq(&c, output)))
        {
            outputs.push(Arc::downgrade(output));
        }
    }

    pub(crate) fn remove_output(&self, output: &Arc<OutputDevice>) {
        // Expired edges are left for the next prune.
        self.outputs
            .lock()
            .unwrap()
            .retain(|candidate| {
                candidate
                    .upgrade()
                    .map_or(true, |c| !Arc::ptr_eq(&c, output))
            });
    }

    /// Drop edges to outputs that no longer exist, then return the live set.
    pub(crate) fn live_outputs(&self) -> Vec<Arc<OutputDevice>> {
        let mut outputs = self.outputs.lock().unwrap();
        outputs.retain(|candidate| candidate.strong_count() > 0);
        outputs
            .iter()
            .filter_map(|candidate| candidate.upgrade())
            .collect()
    }

    // The router's tick thread is the sole reader of an input region (the
    // worker on the far side only writes); see the safety note on
    // `TripleBuffer::read`.

    pub(crate) fn about_to_read(&self) {
        self.region.buffer().about_to_read();
    }

    pub(crate) fn read_frame(&self) -> &Frame {
        unsafe { self.region.buffer().read() }
    }
}

/// A session's strong handle to whichever device it registered.
///
/// Dropping it is the teardown path: the region is unlinked and every weak
/// reference in the matrix decays.
pub enum Device {
    Input(Arc<InputDevice>),
    Output(Arc<OutputDevice>),
}

impl Device {
    pub fn name(&self) -> &str {
        match self {
            Device::Input(input) => input.name(),
            Device::Output(output) => output.name(),
        }
    }
}

/// What the compositor works through on one tick: every live output, plus
/// each live input (display order) with its live connected outputs. Inputs
/// with no connected output are omitted — they are not even read, which
/// saves their slot rotation.
pub(crate) struct TickSnapshot {
    pub outputs: Vec<Arc<OutputDevice>>,
    pub composites: Vec<(Arc<InputDevice>, Vec<Arc<OutputDevice>>)>,
}

/// Snapshot of the topology for rendering the matrix UI.
pub struct MatrixView {
    pub outputs: Vec<DeviceView>,
    pub inputs: Vec<InputView>,
}

pub struct DeviceView {
    pub name: String,
    pub port: u16,
}

pub struct InputView {
    pub name: String,
    pub port: u16,
    /// Connection flags, index-aligned with `MatrixView::outputs`
    pub connected: Vec<bool>,
}

#[derive(Default)]
struct MatrixState {
    /// Display order, back-to-front
    inputs: Vec<Weak<InputDevice>>,
    outputs: Vec<Weak<OutputDevice>>,
}

impl MatrixState {
    fn reap(&mut self) {
        self.inputs.retain(|input| input.strong_count() > 0);
        self.outputs.retain(|output| output.strong_count() > 0);
    }

    fn find_input(&self, name: &str) -> Option<Arc<InputDevice>> {
        self.inputs
            .iter()
            .filter_map(|input| input.upgrade())
            .find(|input| input.name() == name)
    }

    fn find_output(&self, name: &str) -> Option<Arc<OutputDevice>> {
        self.outputs
            .iter()
            .filter_map(|output| output.upgrade())
            .find(|output| output.name() == name)
    }

    fn input_position(&self, name: &str) -> Option<usize> {
        self.inputs
            .iter()
            .position(|input| input.upgrade().is_some_and(|input| input.name() == name))
    }
}

/// The connection matrix: weak references to every registered device plus
/// the reload broadcast that tells browser UIs to refresh.
///
/// Mutated by control-plane handler tasks and read by the tick thread, all
/// under one short-critical-section lock — never held across the pixel
/// loop.
pub struct Matrix {
    state: Mutex<MatrixState>,
    reload: broadcast::Sender<()>,
}

impl Default for Matrix {
    fn default() -> Self {
        Self::new()
    }
}

impl Matrix {
    pub fn new() -> Matrix {
        let (reload, _) = broadcast::channel(16);
        Matrix {
            state: Mutex::new(MatrixState::default()),
            reload,
        }
    }

    /// Append a freshly registered input to the end of the display order.
    pub fn add_input(&self, input: &Arc<InputDevice>) {
        let mut state = self.state.lock().unwrap();
        state.inputs.push(Arc::downgrade(input));
        tracing::info!(input = %input.name(), port = input.port(), "input registered");
    }

    /// Register an output and publish its first, cleared frame so a consumer
    /// attaching immediately reads black silence rather than garbage.
    pub fn add_output(&self, output: &Arc<OutputDevice>) {
        output.clear_frame();
        output.publish();
        let mut state = self.state.lock().unwrap();
        state.outputs.push(Arc::downgrade(output));
        tracing::info!(output = %output.name(), port = output.port(), "output registered");
    }

    /// Move the named input one step later in display order (further
    /// forward, i.e. composited on top of more inputs).
    pub fn bring_input_forward(&self, name: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.reap();
            if let Some(i) = state.input_position(name) {
                if i + 1 < state.inputs.len() {
                    state.inputs.swap(i, i + 1);
                }
            } else {
                tracing::warn!(input = %name, "cannot reorder unknown input");
            }
        }
        self.notify_reload();
    }

    /// Move the named input one step earlier in display order.
    pub fn bring_input_backward(&self, name: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.reap();
            if let Some(i) = state.input_position(name) {
                if i > 0 {
                    state.inputs.swap(i, i - 1);
                }
            } else {
                tracing::warn!(input = %name, "cannot reorder unknown input");
            }
        }
        self.notify_reload();
    }

    /// Create (`wanted = true`) or remove (`wanted = false`) the edge
    /// between the named input and output. Creating an existing edge is a
    /// no-op; so is removing a missing one.
    pub fn connect(&self, input_name: &str, output_name: &str, wanted: bool) {
        {
            let state = self.state.lock().unwrap();
            match (state.find_input(input_name), state.find_output(output_name)) {
                (Some(input), Some(output)) => {
                    if wanted {
                        input.add_output(&output);
                    } else {
                        input.remove_output(&output);
                    }
                }
                (Some(_), None) => {
                    tracing::warn!(output = %output_name, "cannot connect unknown output")
                }
                (None, Some(_)) => {
                    tracing::warn!(input = %input_name, "cannot connect unknown input")
                }
                (None, None) => tracing::warn!(
                    input = %input_name,
                    output = %output_name,
                    "cannot connect unknown input and output"
                ),
            }
        }
        self.notify_reload();
    }

    /// Whether the named edge currently exists.
    pub fn is_connected(&self, input_name: &str, output_name: &str) -> bool {
        let state = self.state.lock().unwrap();
        match (state.find_input(input_name), state.find_output(output_name)) {
            (Some(input), Some(output)) => input.has_output(&output),
            _ => false,
        }
    }

    /// Subscribe to reload events for a browser UI session.
    pub fn subscribe_reload(&self) -> broadcast::Receiver<()> {
        self.reload.subscribe()
    }

    fn notify_reload(&self) {
        // No subscribers is fine; nobody is watching the UI.
        let _ = self.reload.send(());
    }

    /// Reap expired devices, then snapshot the topology for the UI.
    pub fn ui_snapshot(&self) -> MatrixView {
        let mut state = self.state.lock().unwrap();
        state.reap();

        let outputs: Vec<Arc<OutputDevice>> = state
            .outputs
            .iter()
            .filter_map(|output| output.upgrade())
            .collect();

        let inputs = state
            .inputs
            .iter()
            .filter_map(|input| input.upgrade())
            .map(|input| InputView {
                name: input.name().to_owned(),
                port: input.port(),
                connected: outputs.iter().map(|o| input.has_output(o)).collect(),
            })
            .collect();

        MatrixView {
            outputs: outputs
                .iter()
                .map(|output| DeviceView {
                    name: output.name().to_owned(),
                    port: output.port(),
                })
                .collect(),
            inputs,
        }
    }

    /// Reap expired devices and edges, then snapshot the live topology for
    /// one compositor pass.
    pub(crate) fn tick_snapshot(&self) -> TickSnapshot {
        let mut state = self.state.lock().unwrap();
        state.reap();

        let outputs: Vec<Arc<OutputDevice>> = state
            .outputs
            .iter()
            .filter_map(|output| output.upgrade())
            .collect();

        let composites = state
            .inputs
            .iter()
            .filter_map(|input| input.upgrade())
            .filter_map(|input| {
                let outputs = input.live_outputs();
                if outputs.is_empty() {
                    None
                } else {
                    Some((input, outputs))
                }
            })
            .collect();

        TickSnapshot {
            outputs,
            composites,
        }
    }
}
