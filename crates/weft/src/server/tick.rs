//! The compositor tick: one output frame per tick, 25 ticks per second.
//!
//! The loop runs on its own OS thread so control-plane latency can never
//! stall frame production. Each pass snapshots the live topology under the
//! matrix lock, then composites entirely outside it. If a pass overruns the
//! 40 ms period the next one starts immediately — frame drop is silent and
//! preferable to queueing.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::Matrix;

/// The frame period: 25 fps.
pub const TICK_PERIOD: Duration = Duration::from_millis(40);

impl Matrix {
    /// Run exactly one compositor pass.
    ///
    /// Reaps expired devices, zeroes every live output's writable frame,
    /// composites each live input in display order onto its connected
    /// outputs, then publishes all outputs. Inputs with no connected output
    /// are not even read. Public so tests (and tools) can drive
    /// deterministic ticks without the timing thread.
    pub fn tick_once(&self) {
        let snapshot = self.tick_snapshot();

        for out in &snapshot.outputs {
            out.clear_frame();
        }
        for (input, outs) in &snapshot.composites {
            input.about_to_read();
            let frame = input.read_frame();
            for out in outs {
                out.blend_from(frame);
            }
        }
        for out in &snapshot.outputs {
            out.publish();
        }
    }
}

/// Spawn the tick thread. It runs until `cancel` fires, checked once per
/// tick, and is meant to be joined on shutdown.
pub fn spawn_tick(
    matrix: Arc<Matrix>,
    cancel: CancellationToken,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("weft-tick".into()).spawn(move || {
        tracing::info!(period_ms = TICK_PERIOD.as_millis() as u64, "compositor tick started");
        while !cancel.is_cancelled() {
            let next_deadline = Instant::now() + TICK_PERIOD;
            matrix.tick_once();
            let now = Instant::now();
            if now < next_deadline {
                thread::sleep(next_deadline - now);
            }
        }
        tracing::info!("compositor tick stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedRegion;
    use crate::server::{InputDevice, OutputDevice};

    #[test]
    fn tick_on_an_empty_matrix_is_a_no_op() {
        let matrix = Matrix::new();
        matrix.tick_once();
    }

    #[test]
    fn unconnected_input_is_not_read() {
        let matrix = Matrix::new();
        let input = Arc::new(InputDevice::new(1).unwrap());
        matrix.add_input(&input);

        // The producer publishes a frame...
        let producer = SharedRegion::attach(input.name()).unwrap();
        unsafe { producer.buffer().write() }.video[0] = 7;
        producer.buffer().done_writing();

        // ...but with no connected output the tick must skip the read,
        // leaving the hand-off pending.
        matrix.tick_once();
        assert!(producer.buffer().has_new());
    }

    #[test]
    fn connected_input_lands_on_the_output() {
        let matrix = Matrix::new();
        let input = Arc::new(InputDevice::new(1).unwrap());
        let output = Arc::new(OutputDevice::new(2).unwrap());
        matrix.add_input(&input);
        matrix.add_output(&output);
        matrix.connect(input.name(), output.name(), true);

        let producer = SharedRegion::attach(input.name()).unwrap();
        let frame = unsafe { producer.buffer().write() };
        frame.video[..4].copy_from_slice(&[0, 0, 255, 255]);
        frame.audio[0] = 41;
        producer.buffer().done_writing();

        matrix.tick_once();

        let consumer = SharedRegion::attach(output.name()).unwrap();
        consumer.buffer().about_to_read();
        let published = unsafe { consumer.buffer().read() };
        assert_eq!(&published.video[..4], &[0, 0, 255, 255]);
        assert_eq!(published.audio[0], 41);
    }

    #[test]
    fn disconnected_output_stays_black() {
        let matrix = Matrix::new();
        let input = Arc::new(InputDevice::new(1).unwrap());
        let output = Arc::new(OutputDevice::new(2).unwrap());
        matrix.add_input(&input);
        matrix.add_output(&output);

        let producer = SharedRegion::attach(input.name()).unwrap();
        unsafe { producer.buffer().write() }.fill_bgra(10, 20, 30, 200);
        producer.buffer().done_writing();

        matrix.tick_once();

        let consumer = SharedRegion::attach(output.name()).unwrap();
        consumer.buffer().about_to_read();
        let published = unsafe { consumer.buffer().read() };
        assert!(published.video.iter().all(|&b| b == 0));
    }

    #[test]
    fn tick_thread_stops_on_cancel() {
        let matrix = Arc::new(Matrix::new());
        let cancel = CancellationToken::new();
        let handle = spawn_tick(matrix, cancel.clone()).unwrap();

        std::thread::sleep(TICK_PERIOD * 2);
        cancel.cancel();
        handle.join().unwrap();
    }
}
