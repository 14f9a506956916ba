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

use std::sync::Arc;

use log::trace;

use crate::remote_memory::ReadMemory;
use crate::stats::UnwinderCounter;

use super::cache::LruMap;
use super::python::{
    PythonConfig, StringObjectOffsets, PYTHON_CFRAME_LINENO_ID, PYTHON_STRING_LENGTH_MASK,
};

/// Identity of a code object within a process.
///
/// Code objects are usually allocated once, the first line number guards
/// against most address reuse. An address reused by a function starting on
/// the same line still maps to the stale symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolKey {
    pub code_object: u64,
    pub pid: u32,
    pub first_lineno: i32,
}

impl SymbolKey {
    /// Marks a transition into native code, carries no code object.
    pub const STUB: Self = Self {
        code_object: 0,
        pid: 0,
        first_lineno: PYTHON_CFRAME_LINENO_ID,
    };

    pub fn is_stub(&self) -> bool {
        *self == Self::STUB
    }
}

/// Raw name and file name of a code object as found in the target.
///
/// Both lengths count codepoints of `codepoint_size` bytes. The layout of
/// `data` is `[name][filename]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symbol {
    pub codepoint_size: u8,
    pub name_length: u16,
    pub filename_length: u16,
    pub data: Vec<u8>,
}

impl Symbol {
    fn name_byte_len(&self) -> usize {
        (self.name_length as usize * self.codepoint_size as usize).min(self.data.len())
    }

    pub fn name_bytes(&self) -> &[u8] {
        &self.data[..self.name_byte_len()]
    }

    pub fn filename_bytes(&self) -> &[u8] {
        let start = self.name_byte_len();
        let end = (start + self.filename_length as usize * self.codepoint_size as usize)
            .min(self.data.len());
        &self.data[start..end]
    }
}

pub type SymbolCache = LruMap<SymbolKey, Arc<Symbol>>;

/// Resolves code objects of one process into cached symbols.
pub struct SymbolResolver<'a, M> {
    pub mem: &'a M,
    pub config: &'a PythonConfig,
    pub cache: &'a SymbolCache,
    pub counter: &'a UnwinderCounter,
}

impl<'a, M: ReadMemory> SymbolResolver<'a, M> {
    /// Key the frame running `code` and make sure its symbol is cached.
    ///
    /// `None` skips the frame. A symbol that cannot be decoded still yields
    /// its key, only the cache stays empty for it.
    pub fn resolve(&self, pid: u32, code: u64, buffer: &mut [u8]) -> Option<SymbolKey> {
        let offsets = &self.config.offsets.code_object;
        let first_lineno = match self
            .mem
            .read_i32(code.wrapping_add(offsets.co_firstlineno as u64))
        {
            Ok(n) => n,
            Err(e) => {
                UnwinderCounter::inc(&self.counter.read_first_lineno_error);
                trace!("python: failed to read co_firstlineno: {e}");
                return None;
            }
        };
        let key = SymbolKey {
            code_object: code,
            pid,
            first_lineno,
        };

        if self.cache.touch(&key) {
            UnwinderCounter::inc(&self.counter.symbol_cache_hit);
            trace!(
                "python: already saved symbol process#{pid} code object {:#x} first line {}",
                code,
                first_lineno
            );
            return Some(key);
        }
        UnwinderCounter::inc(&self.counter.symbol_cache_miss);

        match self.read_symbol(code, buffer) {
            Some(symbol) => self.cache.insert(key, Arc::new(symbol)),
            None => UnwinderCounter::inc(&self.counter.failed_to_read_symbol),
        }
        Some(key)
    }

    /// Read qualified name and file name of `code` through `buffer`.
    pub fn read_symbol(&self, code: u64, buffer: &mut [u8]) -> Option<Symbol> {
        let offsets = &self.config.offsets.code_object;
        let (name, filename) = match (
            self.mem.read_ptr(code.wrapping_add(offsets.qualname as u64)),
            self.mem.read_ptr(code.wrapping_add(offsets.filename as u64)),
        ) {
            (Ok(n), Ok(f)) => (n, f),
            (Err(e), _) | (_, Err(e)) => {
                UnwinderCounter::inc(&self.counter.read_code_object_error);
                trace!("python: failed to read code object strings: {e}");
                return None;
            }
        };
        trace!("python: read filename and name pointers: {filename:#x}, {name:#x}");

        let log2 = self.config.unicode_type_size_log2 as u32;
        let name_length = self.read_string_object(name, buffer)?;
        let name_bytes = (name_length << log2).min(buffer.len());

        let rest = &mut buffer[name_bytes..];
        let filename_length = if rest.is_empty() {
            0
        } else {
            self.read_string_object(filename, rest)?
        };
        let filename_bytes = (filename_length << log2).min(rest.len());

        Some(Symbol {
            codepoint_size: self.config.codepoint_size(),
            name_length: name_length as u16,
            filename_length: filename_length as u16,
            data: buffer[..name_bytes + filename_bytes].to_vec(),
        })
    }

    /// Returns the number of codepoints stored at the start of `buffer`.
    fn read_string_object(&self, object: u64, buffer: &mut [u8]) -> Option<usize> {
        if object == 0 || buffer.is_empty() {
            return None;
        }
        let offsets = &self.config.offsets.string_object;
        if self.config.unicode_type_size_log2 == 0 {
            self.read_ascii_object(offsets, object, buffer)
        } else {
            self.read_unicode_object(offsets, object, buffer)
        }
    }

    fn read_ascii_object(
        &self,
        offsets: &StringObjectOffsets,
        object: u64,
        buffer: &mut [u8],
    ) -> Option<usize> {
        let state = offsets.state?;
        let status = match self.mem.read_u32(object.wrapping_add(state as u64)) {
            Ok(s) => s,
            Err(e) => {
                trace!("python: failed to read ascii status: {e}");
                return None;
            }
        };
        let ascii = 1u32.checked_shl(offsets.ascii_bit as u32).unwrap_or(0);
        let compact = 1u32.checked_shl(offsets.compact_bit as u32).unwrap_or(0);
        if status & ascii == 0 || status & compact == 0 {
            UnwinderCounter::inc(&self.counter.non_ascii_compact_strings);
            return None;
        }

        let length = self.read_length(offsets, object)?;
        // room for the terminator
        let size = length
            .saturating_add(1)
            .min(buffer.len())
            .min(PYTHON_STRING_LENGTH_MASK + 1);
        match self
            .mem
            .read_cstring_bounded(object.wrapping_add(offsets.data as u64), &mut buffer[..size])
        {
            Ok(n) => {
                trace!("python: read ascii string of length {}", n - 1);
                Some(n - 1)
            }
            Err(e) => {
                trace!("python: failed to read ascii string data: {e}");
                None
            }
        }
    }

    fn read_unicode_object(
        &self,
        offsets: &StringObjectOffsets,
        object: u64,
        buffer: &mut [u8],
    ) -> Option<usize> {
        let data = match self.mem.read_ptr(object.wrapping_add(offsets.data as u64)) {
            Ok(0) => {
                trace!("python: read NULL string pointer");
                return None;
            }
            Ok(p) => p,
            Err(e) => {
                trace!("python: failed to read string pointer: {e}");
                return None;
            }
        };
        let length = self.read_length(offsets, object)?;
        let log2 = self.config.unicode_type_size_log2 as u32;
        let size = length
            .checked_shl(log2)
            .filter(|s| s >> log2 == length)
            .unwrap_or(usize::MAX)
            .min(buffer.len())
            .min(PYTHON_STRING_LENGTH_MASK);
        if let Err(e) = self.mem.read_at(data, &mut buffer[..size]) {
            trace!("python: failed to read unicode string: {e}");
            return None;
        }
        Some(size >> log2)
    }

    fn read_length(&self, offsets: &StringObjectOffsets, object: u64) -> Option<usize> {
        match self.mem.read_u64(object.wrapping_add(offsets.length as u64)) {
            Ok(n) if (n as i64) < 0 => None,
            Ok(n) => Some(n as usize),
            Err(e) => {
                trace!("python: failed to read string length: {e}");
                None
            }
        }
    }
}
