/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Remote memory reading utilities for reading process memory.
//!
//! Everything the unwinder knows about a target process comes through
//! [`ReadMemory`]. A read either fills the whole buffer or returns a [`Fault`];
//! it never blocks, retries or guesses. Callers treat a fault as "stop this
//! sub-step".

use libc::{c_void, iovec, pid_t, process_vm_readv};
use log::trace;
use thiserror::Error;

const PAGE_SIZE: u64 = 4096;

/// A failed read of `len` bytes at `address` in the target address space.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("failed to read {len} bytes at {address:#x}")]
pub struct Fault {
    pub address: u64,
    pub len: usize,
}

impl Fault {
    pub fn new(address: u64, len: usize) -> Self {
        Self { address, len }
    }
}

/// Fallible access to the address space of a target process.
///
/// Scalars are read in native byte order; the profiler and the target are
/// assumed to share architecture and pointer width.
pub trait ReadMemory {
    /// Fill `buffer` with the bytes at `address`. Partial reads are faults.
    fn read_at(&self, address: u64, buffer: &mut [u8]) -> Result<(), Fault>;

    fn read_u8(&self, address: u64) -> Result<u8, Fault> {
        let mut buf = [0u8; 1];
        self.read_at(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u32(&self, address: u64) -> Result<u32, Fault> {
        let mut buf = [0u8; 4];
        self.read_at(address, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    fn read_i32(&self, address: u64) -> Result<i32, Fault> {
        let mut buf = [0u8; 4];
        self.read_at(address, &mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    fn read_u64(&self, address: u64) -> Result<u64, Fault> {
        let mut buf = [0u8; 8];
        self.read_at(address, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Read a pointer-sized value.
    fn read_ptr(&self, address: u64) -> Result<u64, Fault> {
        self.read_u64(address)
    }

    /// Read a NUL-terminated string into `buffer` without exceeding it.
    ///
    /// At most `buffer.len() - 1` bytes are copied, the result is always
    /// NUL-terminated and the returned length includes the terminator. The
    /// string is read one page at a time, so a short string that ends right
    /// before an unmapped page is still readable. An empty buffer is a fault.
    fn read_cstring_bounded(&self, address: u64, buffer: &mut [u8]) -> Result<usize, Fault> {
        let Some(limit) = buffer.len().checked_sub(1) else {
            return Err(Fault::new(address, 0));
        };

        let mut copied = 0;
        // one iteration per touched page, bounded by `limit`
        while copied < limit {
            let cursor = address.wrapping_add(copied as u64);
            let page_left = (PAGE_SIZE - cursor % PAGE_SIZE) as usize;
            let chunk = page_left.min(limit - copied);
            let dst = &mut buffer[copied..copied + chunk];
            self.read_at(cursor, dst)?;
            if let Some(nul) = dst.iter().position(|&b| b == 0) {
                copied += nul;
                buffer[copied] = 0;
                return Ok(copied + 1);
            }
            copied += chunk;
        }
        buffer[copied] = 0;
        Ok(copied + 1)
    }
}

impl<M: ReadMemory + ?Sized> ReadMemory for &M {
    fn read_at(&self, address: u64, buffer: &mut [u8]) -> Result<(), Fault> {
        (**self).read_at(address, buffer)
    }
}

/// A reader for remote process memory using process_vm_readv.
pub struct RemoteMemory {
    pid: pid_t,
}

impl RemoteMemory {
    /// Create a new remote memory reader for the given process ID.
    pub fn new(pid: u32) -> Self {
        Self { pid: pid as pid_t }
    }

    pub fn pid(&self) -> u32 {
        self.pid as u32
    }
}

impl ReadMemory for RemoteMemory {
    fn read_at(&self, address: u64, buffer: &mut [u8]) -> Result<(), Fault> {
        if buffer.is_empty() {
            return Ok(());
        }
        if address.checked_add(buffer.len() as u64).is_none() {
            return Err(Fault::new(address, buffer.len()));
        }

        let local_iov = iovec {
            iov_base: buffer.as_mut_ptr() as *mut c_void,
            iov_len: buffer.len(),
        };

        let remote_iov = iovec {
            iov_base: address as *mut c_void,
            iov_len: buffer.len(),
        };

        // SAFETY:
        // 1. `local_iov` describes exactly `buffer`, which is exclusively borrowed
        //    for the duration of the call, so the kernel cannot write out of bounds
        // 2. both iov counts are 1, matching the single iovec structures provided
        // 3. the remote range is only dereferenced by the kernel; an unmapped or
        //    protected range makes the call fail, it cannot fault this process
        let bytes_read = unsafe {
            process_vm_readv(
                self.pid,
                &local_iov as *const iovec,
                1, // local iov count
                &remote_iov as *const iovec,
                1, // remote iov count
                0, // flags
            )
        };

        if bytes_read < 0 || bytes_read as usize != buffer.len() {
            trace!(
                "read process#{} memory at {:#x} failed: got {} of {} bytes",
                self.pid,
                address,
                bytes_read,
                buffer.len()
            );
            return Err(Fault::new(address, buffer.len()));
        }

        Ok(())
    }
}
