//! weft — a live video routing matrix.
//!
//! A router process supervises independent input and output worker
//! processes. Each worker registers over a websocket and is handed the name
//! of a shared-memory region backing a [`TripleBuffer`] of full video+audio
//! frames; the router composites every connected (input, output) pair at a
//! fixed 25 fps cadence with pre-multiplied alpha-over blending.
//!
//! Feature flags control which layers are compiled:
//!
//! - **Core types** (always available): [`Frame`], [`TripleBuffer`],
//!   [`SharedRegion`], register-target encoding
//! - **`router`**: device registry, connection matrix, compositor tick loop
//! - **`web`**: axum HTTP + websocket control plane (implies `router`)
//! - **`worker`**: worker-side client for registering and attaching

// Core modules (always compiled)
mod buffer;
mod frame;
mod protocol;
mod region;

pub use buffer::TripleBuffer;
pub use frame::{
    Frame, AUDIO_CHANNELS, AUDIO_SAMPLES, FRAME_HEIGHT, FRAME_PITCH, FRAME_RATE, FRAME_WIDTH,
    SAMPLE_RATE, VIDEO_BYTES,
};
pub use protocol::{register_target, RegisterTarget, Role, REGION_NAME_LEN};
pub use region::{SharedRegion, REGION_SIZE};

// Router: device registry, matrix, compositor
#[cfg(feature = "router")]
pub mod server;

// Web: axum control plane (worker registration + browser UI)
#[cfg(feature = "web")]
pub mod web;

// Worker: client side of the registration handshake
#[cfg(feature = "worker")]
pub mod worker;
