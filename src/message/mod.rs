//! The wire vocabulary: the fixed-size [Envelope], the code space that classifies it, and the
//!  typed per-profile commands and events that are carried in its payload.

pub mod adapter;
pub mod code;
pub mod envelope;
pub mod hid_device;
pub mod manager;
pub mod packet;
pub mod spp;
pub mod types;

pub use code::*;
pub use envelope::{Envelope, ResultWord, ENVELOPE_SIZE, PAYLOAD_SIZE, RESULT_SIZE};
pub use packet::{Command, Event, Registration, ResultShape};
