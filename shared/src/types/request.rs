//! Request identity attached to every sample

use crate::strings::{StringRef, Strings};
use crate::types::sample::Pid;

/// Identifies the unit of work a sampler is attached to
///
/// Created once per sampler; every sample carries a copy whose strings hold
/// their own references.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Request {
    pub pid: Pid,

    /// Seconds since the profiler started, at activation
    pub elapsed: f64,

    pub path: Option<StringRef>,
    pub method: Option<StringRef>,
    pub uri: Option<StringRef>,
}

impl Default for Request {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Request {
    pub const EMPTY: Request = Request {
        pid: 0,
        elapsed: 0.0,
        path: None,
        method: None,
        uri: None,
    };

    /// Build a request, copying metadata into temporary strings
    ///
    /// Metadata that does not fit in the string arena is dropped.
    pub fn create(
        strings: &Strings,
        pid: Pid,
        elapsed: f64,
        path: Option<&str>,
        method: Option<&str>,
        uri: Option<&str>,
    ) -> Self {
        let temporary = |value: Option<&str>| {
            value.and_then(|v| strings.make_temporary(v.as_bytes()).ok())
        };

        Self {
            pid,
            elapsed,
            path: temporary(path),
            method: temporary(method),
            uri: temporary(uri),
        }
    }

    /// Take a reference to every string of the request
    pub fn copy(&self, strings: &Strings) -> Self {
        Self {
            pid: self.pid,
            elapsed: self.elapsed,
            path: self.path.map(|s| strings.copy(s)),
            method: self.method.map(|s| strings.copy(s)),
            uri: self.uri.map(|s| strings.copy(s)),
        }
    }

    /// Drop the references held by this request
    pub fn release(&self, strings: &Strings) {
        for string in [self.path, self.method, self.uri].into_iter().flatten() {
            strings.release(string);
        }
    }
}
