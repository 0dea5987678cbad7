//! Wire protocol definitions
//!
//! Samples are streamed as JSON lines (see [`crate::types::record`]); control
//! requests use the fixed binary frame defined here.

pub mod control;

pub use control::{ControlCommand, ControlMessage, CONTROL_MESSAGE_SIZE};
