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

use std::hash::Hasher;
use std::path::Path;

use ahash::AHasher;
use log::{debug, trace};
use regex::Regex;

use crate::maps::MemoryArea;

pub type BinaryId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnwindType {
    Disabled,
    #[default]
    FramePointer,
    Dwarf,
}

/// A special binary mapped into a process, with its load address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryBinding {
    pub id: BinaryId,
    pub start_address: u64,
}

/// Per-process record created when a process is attached.
///
/// The interpreter binary may differ from the main binary when CPython is
/// dynamically linked through `libpython`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub unwind_type: UnwindType,
    pub main_binary_id: BinaryId,
    pub interpreter_binary: Option<BinaryBinding>,
    pub pthread_binary: Option<BinaryBinding>,
}

/// What the sampling event knows about the interrupted thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleContext {
    pub pid: u32,
    /// Thread id in the innermost pid namespace.
    pub tid: u32,
    /// Thread control block pointer (fsbase on x86_64), 0 if unknown.
    pub tcb: u64,
}

/// Identifies a binary by path and inode.
pub fn binary_id(path: &str, inode: u64) -> BinaryId {
    let mut hasher = AHasher::default();
    hasher.write(path.as_bytes());
    hasher.write_u64(inode);
    hasher.finish()
}

thread_local! {
    static PYTHON_REGEX: Regex = Regex::new(r"/(lib)?python\d?(\.\d{1,2})?[mdu]?(\.so(\.[\d.]+)?)?$").unwrap();
    static PTHREAD_REGEX: Regex = Regex::new(r"/(libc|libpthread)([-.][\w.-]*)?\.so(\.\d+)?$").unwrap();
}

pub fn is_python_binary(path: &str) -> bool {
    PYTHON_REGEX.with(|r| r.is_match(path))
}

pub fn is_glibc_pthread_binary(path: &str) -> bool {
    // musl keeps tsd behind a single pointer and is not supported
    !path.contains("musl") && PTHREAD_REGEX.with(|r| r.is_match(path))
}

impl ProcessInfo {
    /// Bind the interpreter and pthread binaries found in executable areas.
    ///
    /// `libpython` wins over the executable when both look like python, since
    /// a dynamically linked interpreter keeps its runtime in the library.
    pub fn from_memory_areas(pid: u32, exe_path: &Path, areas: &[MemoryArea]) -> Self {
        let mut info = ProcessInfo {
            pid,
            ..Default::default()
        };
        let exe_path = exe_path.to_str().unwrap_or_default();
        for area in areas {
            let binding = BinaryBinding {
                id: binary_id(&area.path, area.inode),
                start_address: area.m_start,
            };
            if area.path == exe_path {
                info.main_binary_id = binding.id;
            }
            if is_python_binary(&area.path) {
                let is_lib = area.path.contains("libpython");
                if info.interpreter_binary.is_none() || is_lib {
                    trace!("process#{pid} python binary {}", area);
                    info.interpreter_binary.replace(binding);
                }
            } else if is_glibc_pthread_binary(&area.path) {
                let prefer = area.path.contains("libc.so") || info.pthread_binary.is_none();
                if prefer {
                    trace!("process#{pid} pthread binary {}", area);
                    info.pthread_binary.replace(binding);
                }
            }
        }
        debug!(
            "process#{pid} interpreter: {:?} pthread: {:?}",
            info.interpreter_binary, info.pthread_binary
        );
        info
    }
}
