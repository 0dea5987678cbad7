pub mod control;
pub mod stream;
