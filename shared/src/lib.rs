//! Shared memory structures and types for stat
//!
//! This crate holds everything that samplers and consumers share: the
//! shared memory arena, the interned string table, the sample ring buffer,
//! the sample types stored in it, and the control wire format.

pub mod arena;
pub mod buffer;
pub mod protocol;
pub mod shm;
pub mod strings;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use buffer::{ConsumeOutcome, SampleBuffer};
pub use shm::ShmError;
pub use strings::{StringRef, Strings, StringsError};
pub use types::*;
