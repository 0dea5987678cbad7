//! Serialisable form of a sample
//!
//! This is what stream clients and dump files see: one JSON object per line.
//! Strings are copied out of shared memory so a record can outlive the
//! sample it was built from.

use crate::strings::{StringRef, Strings};
use crate::types::sample::{Sample, SampleKind, Symbol};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub request: RequestRecord,
    pub elapsed: f64,
    pub memory: MemoryRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<SymbolRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opline: Option<OplineRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<SymbolRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arginfo: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub pid: i32,
    pub elapsed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub used: u64,
    pub peak: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplineRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opcode: Option<String>,
}

fn owned(string: Option<StringRef>) -> Option<String> {
    string.map(|s| s.to_string_lossy().into_owned())
}

impl SymbolRecord {
    fn from_symbol(symbol: &Symbol) -> Option<Self> {
        if symbol.is_empty() {
            return None;
        }

        Some(Self {
            file: owned(symbol.file),
            scope: owned(symbol.scope),
            function: owned(symbol.function),
        })
    }

    /// `Class::function`, or just the function name
    pub fn qualified_name(&self) -> String {
        match (&self.scope, &self.function) {
            (Some(scope), Some(function)) => format!("{}::{}", scope, function),
            (None, Some(function)) => function.clone(),
            (Some(scope), None) => scope.clone(),
            (None, None) => "{main}".to_string(),
        }
    }
}

impl SampleRecord {
    pub fn from_sample(sample: &Sample, strings: &Strings) -> Self {
        let request = &sample.request;
        let mut record = Self {
            kind: sample.kind.name().to_string(),
            request: RequestRecord {
                pid: request.pid,
                elapsed: request.elapsed,
                path: owned(request.path),
                method: owned(request.method),
                uri: owned(request.uri),
            },
            elapsed: sample.elapsed,
            memory: MemoryRecord {
                used: sample.memory.used,
                peak: sample.memory.peak,
            },
            symbol: None,
            opline: None,
            caller: None,
            arginfo: Vec::new(),
        };

        match &sample.kind {
            SampleKind::Unused | SampleKind::Memory => {}
            SampleKind::Internal {
                symbol,
                caller,
                arginfo,
            } => {
                record.symbol = SymbolRecord::from_symbol(symbol);
                record.caller = SymbolRecord::from_symbol(caller);
                record.arginfo = arginfo.as_slice().iter().map(|a| a.to_string()).collect();
            }
            SampleKind::User {
                symbol,
                opline,
                arginfo,
            } => {
                record.symbol = SymbolRecord::from_symbol(symbol);
                record.arginfo = arginfo.as_slice().iter().map(|a| a.to_string()).collect();

                let opcode = if opline.opcode > 0 {
                    owned(strings.lookup_opcode(opline.opcode))
                } else {
                    None
                };
                let opline = OplineRecord {
                    line: opline.line.filter(|l| *l > 0),
                    offset: Some(opline.offset).filter(|o| *o > 0),
                    opcode,
                };
                if opline != OplineRecord::default() {
                    record.opline = Some(opline);
                }
            }
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::request::Request;
    use crate::types::sample::{ArgInfo, ArgType, Memory, Opline};

    #[test]
    fn test_memory_record_shape() {
        let strings = Strings::startup(64 * 1024, &[]).unwrap();
        let sample = Sample {
            request: Request {
                pid: 7,
                ..Request::EMPTY
            },
            elapsed: 1.25,
            memory: Memory {
                used: 1024,
                peak: 2048,
            },
            kind: SampleKind::Memory,
        };

        let json = serde_json::to_value(SampleRecord::from_sample(&sample, &strings)).unwrap();
        assert_eq!(json["type"], "memory");
        assert_eq!(json["request"]["pid"], 7);
        assert_eq!(json["memory"]["peak"], 2048);
        assert!(json.get("symbol").is_none());
        assert!(json.get("opline").is_none());
    }

    #[test]
    fn test_user_record_shape() {
        let strings = Strings::startup(64 * 1024, &["ZEND_NOP", "ZEND_ADD"]).unwrap();
        let mut arginfo = ArgInfo::default();
        arginfo.push(ArgType::Int(3));

        let sample = Sample {
            request: Request::EMPTY,
            elapsed: 0.0,
            memory: Memory::default(),
            kind: SampleKind::User {
                symbol: Symbol {
                    file: strings.intern_owned(b"/app.php").ok(),
                    scope: strings.intern_owned(b"Foo").ok(),
                    function: strings.intern_owned(b"bar").ok(),
                },
                opline: Opline {
                    line: Some(12),
                    offset: 4,
                    opcode: 1,
                },
                arginfo,
            },
        };

        let record = SampleRecord::from_sample(&sample, &strings);
        let symbol = record.symbol.clone().unwrap();
        assert_eq!(symbol.qualified_name(), "Foo::bar");

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["symbol"]["file"], "/app.php");
        assert_eq!(json["opline"]["line"], 12);
        assert_eq!(json["opline"]["opcode"], "ADD");
        assert_eq!(json["arginfo"][0], "int(3)");
        assert!(json.get("caller").is_none());
    }
}
