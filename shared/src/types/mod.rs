//! Sample, request and record types

pub mod record;
pub mod request;
pub mod sample;

pub use record::SampleRecord;
pub use request::Request;
pub use sample::{ArgInfo, ArgType, Memory, Opline, Pid, Sample, SampleKind, Symbol, MAX_ARGINFO};
