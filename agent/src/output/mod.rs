//! Output writers

pub mod json;

pub use json::write_dump;
