//! Reading memory of another process
//!
//! Reads go through `process_vm_readv`: the target is never stopped or
//! signalled, so any read may observe memory that is being freed or reused.
//! Callers treat every failure as "this data is gone" rather than an error.

use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid as NixPid;
use stat_shared::Pid;
use std::io::IoSliceMut;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("null remote address")]
    Null,

    #[error("short read at {address:#x}: {read} of {expected} bytes")]
    Short {
        address: u64,
        read: usize,
        expected: usize,
    },

    #[error("read at {address:#x} failed: {source}")]
    Os {
        address: u64,
        #[source]
        source: nix::Error,
    },
}

/// Source of remote memory
pub trait RemoteReader: Send + Sync {
    /// Fill `buf` from `address` in process `pid`
    fn read(&self, pid: Pid, address: u64, buf: &mut [u8]) -> Result<(), ReadError>;
}

/// Reads via `process_vm_readv(2)`
///
/// Requires ptrace access to the target (same uid with a permissive
/// `ptrace_scope`, or `CAP_SYS_PTRACE`).
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessVmReader;

impl RemoteReader for ProcessVmReader {
    fn read(&self, pid: Pid, address: u64, buf: &mut [u8]) -> Result<(), ReadError> {
        if address == 0 {
            return Err(ReadError::Null);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let expected = buf.len();
        let remote = [RemoteIoVec {
            base: address as usize,
            len: expected,
        }];
        let mut local = [IoSliceMut::new(buf)];

        let read = process_vm_readv(NixPid::from_raw(pid), &mut local, &remote)
            .map_err(|source| ReadError::Os { address, source })?;

        if read != expected {
            return Err(ReadError::Short {
                address,
                read,
                expected,
            });
        }

        Ok(())
    }
}
