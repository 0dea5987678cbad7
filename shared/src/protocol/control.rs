//! Control message wire format
//!
//! A control message is a fixed 16 byte frame: a 64 bit kind followed by a
//! 64 bit parameter, both little endian. Bincode with fixint encoding gives
//! exactly that layout, so the agent and any client agree byte for byte.

use anyhow::Result;
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Size in bytes of an encoded [`ControlMessage`]
pub const CONTROL_MESSAGE_SIZE: usize = 16;

/// Set the sampling interval; parameter is microseconds and must be positive
pub const CONTROL_INTERVAL: i64 = 1 << 1;

/// Enable (non-zero) or disable (zero) argument capture
pub const CONTROL_ARGINFO: i64 = 1 << 2;

fn wire_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub kind: i64,
    pub param: i64,
}

/// A decoded control request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Interval { micros: u64 },
    Arginfo { enabled: bool },
    Unknown { kind: i64, param: i64 },
}

impl ControlMessage {
    pub fn interval(micros: u64) -> Self {
        Self {
            kind: CONTROL_INTERVAL,
            param: micros.min(i64::MAX as u64) as i64,
        }
    }

    pub fn arginfo(enabled: bool) -> Self {
        Self {
            kind: CONTROL_ARGINFO,
            param: i64::from(enabled),
        }
    }

    pub fn to_bytes(&self) -> Result<[u8; CONTROL_MESSAGE_SIZE]> {
        let bytes = wire_bincode().serialize(self)?;
        let mut frame = [0u8; CONTROL_MESSAGE_SIZE];
        if bytes.len() != CONTROL_MESSAGE_SIZE {
            anyhow::bail!("control message encoded to {} bytes", bytes.len());
        }
        frame.copy_from_slice(&bytes);
        Ok(frame)
    }

    pub fn from_bytes(bytes: &[u8; CONTROL_MESSAGE_SIZE]) -> Result<Self> {
        wire_bincode().deserialize(bytes).map_err(Into::into)
    }

    /// Interpret the message; a non-positive interval is ignored as unknown
    pub fn command(&self) -> ControlCommand {
        match self.kind {
            CONTROL_INTERVAL if self.param > 0 => ControlCommand::Interval {
                micros: self.param as u64,
            },
            CONTROL_ARGINFO => ControlCommand::Arginfo {
                enabled: self.param != 0,
            },
            kind => ControlCommand::Unknown {
                kind,
                param: self.param,
            },
        }
    }
}
