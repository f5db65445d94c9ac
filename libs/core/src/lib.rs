//! IoT voice relay core contracts and value types.
//!
//! This crate exposes the wire envelope exchanged between devices, the agent task queue and
//! the synthesis workers, the bus channel catalogue, TTS settings resolution and the agent
//! gateway contract used by the dispatcher.
pub mod agent;
pub mod channels;
pub mod envelope;
pub mod payload;
pub mod settings;

pub use agent::*;
pub use channels::*;
pub use envelope::*;
pub use payload::*;
pub use settings::*;
