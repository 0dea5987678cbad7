//! Sample type definitions
//!
//! A [`Sample`] is one observation of a sampled process: its heap counters,
//! and when a frame could be read, the function that was executing. Samples
//! are plain `Copy` values so they can be moved in and out of shared memory
//! slots; the only shared state they point at is interned strings.

use crate::strings::StringRef;
use crate::types::request::Request;

/// Process ID
pub type Pid = i32;

/// Maximum number of argument tags captured per frame
pub const MAX_ARGINFO: usize = 12;

/// Heap counters of the sampled process, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Memory {
    pub used: u64,
    pub peak: u64,
}

/// Where a function is defined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Symbol {
    pub file: Option<StringRef>,
    pub scope: Option<StringRef>,
    pub function: Option<StringRef>,
}

impl Symbol {
    pub const EMPTY: Symbol = Symbol {
        file: None,
        scope: None,
        function: None,
    };

    pub fn is_empty(&self) -> bool {
        self.file.is_none() && self.scope.is_none() && self.function.is_none()
    }
}

/// The instruction being executed in a user function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Opline {
    /// Source line, `None` for opcodes without meaningful line info
    pub line: Option<u32>,

    /// Index of the instruction within its function
    pub offset: u32,

    pub opcode: u8,
}

/// Type tag of one argument passed to the sampled frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgType {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String,
    Array,
    Object,
    Resource,
    Reference,
    Unknown(u8),
}

impl std::fmt::Display for ArgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgType::Null => write!(f, "null"),
            ArgType::Bool(b) => write!(f, "bool({})", u8::from(*b)),
            ArgType::Int(i) => write!(f, "int({})", i),
            ArgType::Float(x) => write!(f, "float({})", x),
            ArgType::String => write!(f, "string"),
            ArgType::Array => write!(f, "array"),
            ArgType::Object => write!(f, "object"),
            ArgType::Resource => write!(f, "resource"),
            ArgType::Reference => write!(f, "reference"),
            ArgType::Unknown(tag) => write!(f, "unknown({})", tag),
        }
    }
}

/// Bounded list of argument tags
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgInfo {
    len: u8,
    tags: [ArgType; MAX_ARGINFO],
}

impl Default for ArgInfo {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl ArgInfo {
    pub const EMPTY: ArgInfo = ArgInfo {
        len: 0,
        tags: [ArgType::Null; MAX_ARGINFO],
    };

    /// Append a tag; tags past [`MAX_ARGINFO`] are dropped
    pub fn push(&mut self, tag: ArgType) -> bool {
        if self.len as usize >= MAX_ARGINFO {
            return false;
        }
        self.tags[self.len as usize] = tag;
        self.len += 1;
        true
    }

    pub fn as_slice(&self) -> &[ArgType] {
        &self.tags[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// What a sample observed
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SampleKind {
    /// Slot holds no sample
    #[default]
    Unused,

    /// Only heap counters could be read
    Memory,

    /// A native function was executing; `caller` is the nearest user frame
    Internal {
        symbol: Symbol,
        caller: Symbol,
        arginfo: ArgInfo,
    },

    /// A user function was executing
    User {
        symbol: Symbol,
        opline: Opline,
        arginfo: ArgInfo,
    },
}

impl SampleKind {
    pub fn name(&self) -> &'static str {
        match self {
            SampleKind::Unused => "unused",
            SampleKind::Memory => "memory",
            SampleKind::Internal { .. } => "internal",
            SampleKind::User { .. } => "user",
        }
    }
}

/// One observation of a sampled process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub request: Request,

    /// Seconds since the profiler started
    pub elapsed: f64,

    pub memory: Memory,
    pub kind: SampleKind,
}

impl Default for Sample {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Sample {
    pub const EMPTY: Sample = Sample {
        request: Request::EMPTY,
        elapsed: 0.0,
        memory: Memory { used: 0, peak: 0 },
        kind: SampleKind::Unused,
    };

    pub fn is_unused(&self) -> bool {
        matches!(self.kind, SampleKind::Unused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arginfo_is_bounded() {
        let mut info = ArgInfo::default();
        for i in 0..20 {
            info.push(ArgType::Int(i));
        }

        assert_eq!(info.len(), MAX_ARGINFO);
        assert_eq!(info.as_slice()[11], ArgType::Int(11));
    }

    #[test]
    fn test_argtype_display() {
        assert_eq!(ArgType::Int(42).to_string(), "int(42)");
        assert_eq!(ArgType::Bool(true).to_string(), "bool(1)");
        assert_eq!(ArgType::Float(1.5).to_string(), "float(1.5)");
        assert_eq!(ArgType::Null.to_string(), "null");
    }

    #[test]
    fn test_empty_sample() {
        let sample = Sample::default();
        assert!(sample.is_unused());
        assert_eq!(sample.kind.name(), "unused");
    }
}
