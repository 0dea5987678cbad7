//! One sampling tick
//!
//! Reconstructs what the target is executing from a handful of remote reads:
//! heap counters, the current frame, its instruction, its function, and the
//! names attached to that function. The target keeps running while this
//! happens, so any read can fail or return memory that was just reused. A
//! failed read demotes the sample to a `Memory` sample instead of aborting.

use crate::sampler::cache::{FunctionInfo, SamplerCache};
use crate::sampler::layout::{RuntimeLayout, Target, ZvalLayout};
use crate::sampler::remote::{ReadError, RemoteReader};
use stat_shared::types::{ArgInfo, ArgType, Memory, Opline, SampleKind, Symbol, MAX_ARGINFO};
use stat_shared::{StringRef, Strings};
use std::sync::Arc;
use tracing::trace;

/// Upper bound on frames walked looking for a user caller
pub const MAX_CALLER_DEPTH: usize = 64;

/// Reads samples for one target
pub struct Capture {
    reader: Arc<dyn RemoteReader>,
    layout: Arc<RuntimeLayout>,
    strings: Arc<Strings>,
    target: Target,
    unlined: [bool; 256],
    cache: SamplerCache,

    /// Snapshot storage reused across ticks
    scratch: Vec<u8>,
}

struct Frame {
    opline: u64,
    func: u64,
    num_args: u32,
    prev: u64,
}

fn word(buf: &[u8], offset: usize) -> u64 {
    buf.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_ne_bytes)
        .unwrap_or(0)
}

fn half(buf: &[u8], offset: usize) -> u32 {
    buf.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
        .unwrap_or(0)
}

fn byte(buf: &[u8], offset: usize) -> u8 {
    buf.get(offset).copied().unwrap_or(0)
}

/// The first `len` bytes of `scratch`, growing it only when too small
fn fill(scratch: &mut Vec<u8>, len: usize) -> &mut [u8] {
    if scratch.len() < len {
        scratch.resize(len, 0);
    }
    &mut scratch[..len]
}

fn decode_arg(layout: &ZvalLayout, zval: &[u8]) -> ArgType {
    let types = &layout.types;
    let value = word(zval, layout.value);

    match byte(zval, layout.kind) {
        t if t == types.undef || t == types.null => ArgType::Null,
        t if t == types.false_ => ArgType::Bool(false),
        t if t == types.true_ => ArgType::Bool(true),
        t if t == types.long => ArgType::Int(value as i64),
        t if t == types.double => ArgType::Float(f64::from_bits(value)),
        t if t == types.string => ArgType::String,
        t if t == types.array => ArgType::Array,
        t if t == types.object => ArgType::Object,
        t if t == types.resource => ArgType::Resource,
        t if t == types.reference => ArgType::Reference,
        t => ArgType::Unknown(t),
    }
}

impl Capture {
    pub fn new(
        reader: Arc<dyn RemoteReader>,
        layout: Arc<RuntimeLayout>,
        strings: Arc<Strings>,
        target: Target,
    ) -> Self {
        let unlined = layout.unlined_opcodes();
        let snapshot = [
            layout.frame.size,
            layout.function.size,
            layout.op.size,
            layout.string.val,
            layout.zval.size * MAX_ARGINFO,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);

        Self {
            reader,
            layout,
            strings,
            target,
            unlined,
            cache: SamplerCache::new(),
            scratch: vec![0; snapshot],
        }
    }

    pub fn cache(&self) -> &SamplerCache {
        &self.cache
    }

    /// Take one sample of the target
    pub fn sample(&mut self, arginfo: bool) -> (Memory, SampleKind) {
        let memory = self.read_memory();

        let kind = match self.read_kind(arginfo) {
            Ok(kind) => kind,
            Err(e) => {
                trace!("pid {} demoted to memory sample: {}", self.target.pid, e);
                SampleKind::Memory
            }
        };

        (memory, kind)
    }

    fn read_word(&self, address: u64) -> Result<u64, ReadError> {
        let mut buf = [0u8; 8];
        self.reader.read(self.target.pid, address, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    fn read_memory(&self) -> Memory {
        let heap = &self.layout.heap;
        let base = self.target.heap;

        Memory {
            used: self.read_word(base + heap.size as u64).unwrap_or(0),
            peak: self.read_word(base + heap.peak as u64).unwrap_or(0),
        }
    }

    fn read_frame(&mut self, address: u64) -> Result<Frame, ReadError> {
        let layout = &self.layout.frame;
        let buf = fill(&mut self.scratch, layout.size);
        self.reader.read(self.target.pid, address, buf)?;

        Ok(Frame {
            opline: word(buf, layout.opline),
            func: word(buf, layout.func),
            num_args: half(buf, layout.num_args),
            prev: word(buf, layout.prev),
        })
    }

    /// Opcode and line number of the instruction at `address`
    fn read_op(&mut self, address: u64) -> Result<(u8, u32), ReadError> {
        let layout = &self.layout.op;
        let buf = fill(&mut self.scratch, layout.size);
        self.reader.read(self.target.pid, address, buf)?;

        Ok((byte(buf, layout.opcode), half(buf, layout.lineno)))
    }

    fn read_function(&mut self, address: u64) -> Result<FunctionInfo, ReadError> {
        if let Some(info) = self.cache.function(address) {
            return Ok(info);
        }

        let layout = &self.layout.function;
        let buf = fill(&mut self.scratch, layout.size);
        self.reader.read(self.target.pid, address, buf)?;

        let kind = byte(buf, layout.kind);
        let flags = half(buf, layout.flags);
        let user = kind == layout.user_kind;

        let info = FunctionInfo {
            user,
            name: word(buf, layout.name),
            scope: word(buf, layout.scope),
            opcodes: if user { word(buf, layout.opcodes) } else { 0 },
            filename: if user { word(buf, layout.filename) } else { 0 },
        };

        if kind == layout.internal_kind || flags & layout.immutable_flag != 0 {
            self.cache.insert_function(address, info);
        }

        Ok(info)
    }

    /// Copy a remote string into the string table
    ///
    /// `Ok(None)` for a null pointer or a full string table. Strings longer
    /// than the layout's `max_len` are cut short and never cached.
    fn read_string(&mut self, address: u64) -> Result<Option<StringRef>, ReadError> {
        if address == 0 {
            return Ok(None);
        }
        if let Some(cached) = self.cache.string(address) {
            return Ok(Some(cached));
        }

        let layout = &self.layout.string;
        let pid = self.target.pid;

        let header = fill(&mut self.scratch, layout.val);
        self.reader.read(pid, address, header)?;
        let type_info = half(header, layout.type_info);
        let len = word(header, layout.len) as usize;

        let truncated = len > layout.max_len;
        let value = fill(&mut self.scratch, len.min(layout.max_len));
        self.reader.read(pid, address + layout.val as u64, value)?;

        let Ok(interned) = self.strings.intern_owned(value) else {
            return Ok(None);
        };
        if type_info & layout.permanent_flag != 0 && !truncated {
            self.cache.insert_string(address, interned);
        }

        Ok(Some(interned))
    }

    /// Read the string pointer stored at `address + offset`, then the string
    fn read_string_at(
        &mut self,
        address: u64,
        offset: usize,
    ) -> Result<Option<StringRef>, ReadError> {
        let string = self.read_word(address + offset as u64)?;
        self.read_string(string)
    }

    fn read_arginfo(&mut self, frame_address: u64, frame: &Frame) -> ArgInfo {
        let mut info = ArgInfo::EMPTY;
        let count = (frame.num_args as usize).min(MAX_ARGINFO);
        if count == 0 {
            return info;
        }

        let zval = &self.layout.zval;
        let buf = fill(&mut self.scratch, zval.size * count);
        let args = frame_address + self.layout.frame.args as u64;
        if self.reader.read(self.target.pid, args, buf).is_err() {
            // the stack moved on; the rest of the frame is still usable
            return info;
        }

        for arg in buf.chunks_exact(zval.size) {
            info.push(decode_arg(zval, arg));
        }
        info
    }

    /// Nearest user function below an internal frame
    fn read_caller(&mut self, mut prev: u64) -> Symbol {
        let mut caller = Symbol::EMPTY;

        for _ in 0..MAX_CALLER_DEPTH {
            let Ok(frame) = self.read_frame(prev) else {
                break;
            };
            let Ok(function) = self.read_function(frame.func) else {
                break;
            };

            if function.user {
                caller.file = self.read_string(function.filename).ok().flatten();
                if function.scope != 0 {
                    caller.scope = self
                        .read_string_at(function.scope, self.layout.class.name)
                        .ok()
                        .flatten();
                    if caller.scope.is_none() {
                        break;
                    }
                }
                caller.function = self.read_string(function.name).ok().flatten();
                break;
            }

            prev = frame.prev;
        }

        caller
    }

    fn read_kind(&mut self, arginfo: bool) -> Result<SampleKind, ReadError> {
        let frame_address = self.read_word(self.target.frame)?;
        if frame_address == 0 {
            return Err(ReadError::Null);
        }

        let frame = self.read_frame(frame_address)?;

        let (opcode, lineno) = if frame.opline != 0 {
            self.read_op(frame.opline)?
        } else {
            (0, 0)
        };

        let args = if arginfo {
            self.read_arginfo(frame_address, &frame)
        } else {
            ArgInfo::EMPTY
        };

        let function = self.read_function(frame.func)?;
        let mut symbol = Symbol::EMPTY;

        if function.scope != 0 {
            symbol.scope = self.read_string_at(function.scope, self.layout.class.name)?;
            if symbol.scope.is_none() {
                return Err(ReadError::Null);
            }
        }

        let kind = if function.user {
            symbol.file = self.read_string(function.filename)?;
            if symbol.file.is_none() {
                return Err(ReadError::Null);
            }

            let line = if self.unlined[opcode as usize] {
                None
            } else {
                Some(lineno)
            };
            let offset = if frame.opline != 0 && frame.opline >= function.opcodes {
                ((frame.opline - function.opcodes) / self.layout.op.size.max(1) as u64) as u32
            } else {
                0
            };

            symbol.function = self.read_string(function.name)?;

            SampleKind::User {
                symbol,
                opline: Opline {
                    line,
                    offset,
                    opcode,
                },
                arginfo: args,
            }
        } else {
            let caller = self.read_caller(frame.prev);
            symbol.function = self.read_string(function.name)?;

            SampleKind::Internal {
                symbol,
                caller,
                arginfo: args,
            }
        };

        Ok(kind)
    }
}
