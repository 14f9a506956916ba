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

//! Scenario tests against a synthetic target address space.


use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize test environment
pub fn setup_test_env() {
    INIT.call_once(|| {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .is_test(true)
            .try_init();
    });
}

/// Common test utilities
pub mod test_utils {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use semver::Version;

    use crate::remote_memory::{Fault, ReadMemory};
    use crate::unwind::process::{BinaryBinding, ProcessInfo, UnwindType};
    use crate::unwind::pthread::{PthreadConfig, PthreadKeyData};
    use crate::unwind::python::*;

    pub const PID: u32 = 4242;
    pub const PYTHON_BINARY_ID: u64 = 0x1111;
    pub const PTHREAD_BINARY_ID: u64 = 0x2222;
    pub const BINARY_BASE: u64 = 0x40_0000;
    pub const RUNTIME_RELATIVE: u64 = 0x1000;
    pub const INTERP_HEAD_RELATIVE: u64 = 0x1200;
    pub const AUTO_TSS_KEY_RELATIVE: u64 = 0x1800;
    pub const TLS_OFFSET: u64 = 0x40;

    const HEAP_BASE: u64 = 0x10_0000_0000;
    const ALLOC_GAP: u64 = 0x100;

    /// A sparse address space made of mapped regions.
    ///
    /// Reads crossing a region boundary fault, like reads of unmapped
    /// addresses do.
    #[derive(Default)]
    pub struct FakeMemory {
        regions: BTreeMap<u64, Vec<u8>>,
        next: u64,
        reads: AtomicUsize,
    }

    impl FakeMemory {
        pub fn map(&mut self, address: u64, data: Vec<u8>) {
            self.regions.insert(address, data);
        }

        pub fn unmap(&mut self, address: u64) {
            self.regions.remove(&address);
        }

        /// Map a zeroed region followed by an unmapped gap.
        pub fn alloc(&mut self, size: usize) -> u64 {
            if self.next == 0 {
                self.next = HEAP_BASE;
            }
            let address = self.next;
            self.map(address, vec![0; size]);
            self.next = (address + size as u64 + ALLOC_GAP + 0xf) & !0xf;
            address
        }

        fn slice_mut(&mut self, address: u64, len: usize) -> &mut [u8] {
            let (start, data) = self
                .regions
                .range_mut(..=address)
                .next_back()
                .expect("write to unmapped memory");
            let offset = (address - start) as usize;
            &mut data[offset..offset + len]
        }

        pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) {
            self.slice_mut(address, bytes.len()).copy_from_slice(bytes);
        }

        pub fn write_u64(&mut self, address: u64, value: u64) {
            self.write_bytes(address, &value.to_ne_bytes());
        }

        pub fn write_u32(&mut self, address: u64, value: u32) {
            self.write_bytes(address, &value.to_ne_bytes());
        }

        pub fn write_i32(&mut self, address: u64, value: i32) {
            self.write_bytes(address, &value.to_ne_bytes());
        }

        pub fn write_u8(&mut self, address: u64, value: u8) {
            self.write_bytes(address, &[value]);
        }

        pub fn read_count(&self) -> usize {
            self.reads.load(Ordering::Relaxed)
        }
    }

    impl ReadMemory for FakeMemory {
        fn read_at(&self, address: u64, buffer: &mut [u8]) -> Result<(), Fault> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let fault = Fault::new(address, buffer.len());
            let (start, data) = self.regions.range(..=address).next_back().ok_or(fault)?;
            let offset = (address - start) as usize;
            let end = offset.checked_add(buffer.len()).ok_or(fault)?;
            if end > data.len() {
                return Err(fault);
            }
            buffer.copy_from_slice(&data[offset..end]);
            Ok(())
        }
    }

    /// 3.11.4+ layout with `_PyCFrame`, frame owners and native thread ids.
    pub fn modern_config() -> PythonConfig {
        PythonConfig {
            thread_state_tls_offset: 0,
            runtime_relative_address: RUNTIME_RELATIVE,
            interp_head_relative_address: 0,
            auto_tss_key_relative_address: AUTO_TSS_KEY_RELATIVE,
            version: encode_version(&Version::new(3, 11, 4)),
            unicode_type_size_log2: 0,
            offsets: PythonInternalsOffsets {
                runtime_state: RuntimeStateOffsets {
                    interpreters_main: Some(48),
                },
                thread_state: ThreadStateOffsets {
                    cframe: Some(56),
                    current_frame: None,
                    thread_id: Some(152),
                    native_thread_id: Some(160),
                    prev_thread: 0,
                    next_thread: 8,
                },
                cframe: CframeOffsets {
                    current_frame: Some(8),
                },
                frame: FrameOffsets {
                    f_code: 32,
                    previous: 48,
                    owner: Some(70),
                },
                interpreter_state: InterpreterStateOffsets {
                    threads_head: 16,
                },
                code_object: CodeObjectOffsets {
                    co_firstlineno: 68,
                    filename: 112,
                    qualname: 128,
                },
                string_object: StringObjectOffsets {
                    length: 16,
                    data: 40,
                    state: Some(32),
                    ..Default::default()
                },
                tss: TssOffsets {
                    is_initialized: Some(0),
                    key: Some(4),
                },
            },
        }
    }

    /// 3.10 layout: frame objects linked by `f_back`, pthread ids only and
    /// the interpreter reached through `interp_head`.
    pub fn legacy_config() -> PythonConfig {
        PythonConfig {
            thread_state_tls_offset: 0,
            runtime_relative_address: 0,
            interp_head_relative_address: INTERP_HEAD_RELATIVE,
            auto_tss_key_relative_address: 0,
            version: encode_version(&Version::new(3, 10, 0)),
            unicode_type_size_log2: 0,
            offsets: PythonInternalsOffsets {
                runtime_state: RuntimeStateOffsets::default(),
                thread_state: ThreadStateOffsets {
                    cframe: None,
                    current_frame: Some(24),
                    thread_id: Some(176),
                    native_thread_id: None,
                    prev_thread: 0,
                    next_thread: 8,
                },
                cframe: CframeOffsets::default(),
                frame: FrameOffsets {
                    f_code: 32,
                    previous: 24,
                    owner: None,
                },
                interpreter_state: InterpreterStateOffsets {
                    threads_head: 8,
                },
                code_object: CodeObjectOffsets {
                    co_firstlineno: 40,
                    filename: 104,
                    qualname: 112,
                },
                string_object: StringObjectOffsets {
                    length: 16,
                    data: 48,
                    state: Some(32),
                    ..Default::default()
                },
                tss: TssOffsets::default(),
            },
        }
    }

    /// Legacy layout with `PyUnicodeObject` strings of `1 << log2` bytes.
    pub fn wide_config(log2: u8) -> PythonConfig {
        let mut config = legacy_config();
        config.version = encode_version(&Version::new(2, 7, 18));
        config.unicode_type_size_log2 = log2;
        config.offsets.string_object = StringObjectOffsets {
            length: 16,
            data: 24,
            state: None,
            ..Default::default()
        };
        config
    }

    pub fn pthread_config() -> PthreadConfig {
        PthreadConfig {
            key_data: PthreadKeyData {
                size: 16,
                value_offset: 8,
                seq_offset: 0,
            },
            first_specific_block_offset: 0x310,
            specific_array_offset: 0x510,
            struct_pthread_pointer_offset: 0x10,
            key_second_level_size: 32,
            key_first_level_size: 32,
            keys_max: 1024,
        }
    }

    /// Builds runtime structures of a fake python process.
    pub struct PythonTarget {
        pub mem: FakeMemory,
        pub config: PythonConfig,
    }

    impl PythonTarget {
        pub fn new(config: PythonConfig) -> Self {
            let mut mem = FakeMemory::default();
            // data section of the interpreter binary
            mem.map(BINARY_BASE, vec![0; 0x4000]);
            Self { mem, config }
        }

        pub fn process_info(&self) -> ProcessInfo {
            ProcessInfo {
                pid: PID,
                unwind_type: UnwindType::FramePointer,
                main_binary_id: PYTHON_BINARY_ID,
                interpreter_binary: Some(BinaryBinding {
                    id: PYTHON_BINARY_ID,
                    start_address: BINARY_BASE,
                }),
                pthread_binary: Some(BinaryBinding {
                    id: PTHREAD_BINARY_ID,
                    start_address: 0x7f00_0000_0000,
                }),
            }
        }

        /// A string object holding `s` in the configured encoding.
        pub fn string(&mut self, s: &str) -> u64 {
            let offsets = self.config.offsets.string_object;
            match self.config.unicode_type_size_log2 {
                0 => {
                    let state = offsets.state.unwrap_or(32) as u64;
                    let object = self.mem.alloc(offsets.data as usize + s.len() + 1);
                    self.mem.write_u64(object + offsets.length as u64, s.len() as u64);
                    let bits = (1u32 << offsets.ascii_bit) | (1u32 << offsets.compact_bit);
                    self.mem.write_u32(object + state, bits);
                    self.mem.write_bytes(object + offsets.data as u64, s.as_bytes());
                    object
                }
                log2 => {
                    let bytes: Vec<u8> = if log2 == 1 {
                        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
                    } else {
                        s.chars().flat_map(|c| (c as u32).to_le_bytes()).collect()
                    };
                    let codepoints = bytes.len() >> log2;
                    let data = self.mem.alloc(bytes.len().max(1));
                    self.mem.write_bytes(data, &bytes);
                    let object = self.mem.alloc(offsets.data as usize + 8);
                    self.mem.write_u64(object + offsets.length as u64, codepoints as u64);
                    self.mem.write_u64(object + offsets.data as u64, data);
                    object
                }
            }
        }

        pub fn code_with_strings(&mut self, name: u64, filename: u64, first_lineno: i32) -> u64 {
            let offsets = self.config.offsets.code_object;
            let code = self.mem.alloc(192);
            self.mem.write_i32(code + offsets.co_firstlineno as u64, first_lineno);
            self.mem.write_u64(code + offsets.qualname as u64, name);
            self.mem.write_u64(code + offsets.filename as u64, filename);
            code
        }

        pub fn code(&mut self, name: &str, filename: &str, first_lineno: i32) -> u64 {
            let name = self.string(name);
            let filename = self.string(filename);
            self.code_with_strings(name, filename, first_lineno)
        }

        pub fn frame(&mut self, code: u64, previous: u64, owner: FrameOwner) -> u64 {
            let offsets = self.config.offsets.frame;
            let frame = self.mem.alloc(80);
            self.mem.write_u64(frame + offsets.f_code as u64, code);
            self.mem.write_u64(frame + offsets.previous as u64, previous);
            if let Some(o) = offsets.owner {
                self.mem.write_u8(frame + o as u64, owner as u8);
            }
            frame
        }

        /// Frames of `codes`, outermost first. Returns the innermost frame.
        pub fn stack(&mut self, codes: &[u64]) -> u64 {
            codes.iter().fold(0, |previous, code| {
                self.frame(*code, previous, FrameOwner::Thread)
            })
        }

        /// A thread state whose current frame is `frame`.
        pub fn thread_state(&mut self, thread_id: u64, frame: u64) -> u64 {
            let offsets = self.config.offsets;
            let ts = self.mem.alloc(256);
            if let Some(o) = offsets.thread_state.native_thread_id.or(offsets.thread_state.thread_id) {
                self.mem.write_u64(ts + o as u64, thread_id);
            }
            match offsets.thread_state.cframe {
                Some(o) => {
                    let cframe = self.mem.alloc(32);
                    let current = offsets.cframe.current_frame.unwrap_or(0);
                    self.mem.write_u64(cframe + current as u64, frame);
                    self.mem.write_u64(ts + o as u64, cframe);
                }
                None => {
                    let current = offsets.thread_state.current_frame.unwrap_or(0);
                    self.mem.write_u64(ts + current as u64, frame);
                }
            }
            ts
        }

        /// Doubly link thread states in list order.
        pub fn link_threads(&mut self, threads: &[u64]) {
            let offsets = self.config.offsets.thread_state;
            for pair in threads.windows(2) {
                self.mem.write_u64(pair[0] + offsets.next_thread as u64, pair[1]);
                self.mem.write_u64(pair[1] + offsets.prev_thread as u64, pair[0]);
            }
        }

        /// Make `head` the thread list of the main interpreter.
        pub fn main_interpreter(&mut self, head: u64) -> u64 {
            let offsets = self.config.offsets;
            let interp = self.mem.alloc(64);
            self.mem
                .write_u64(interp + offsets.interpreter_state.threads_head as u64, head);
            let slot = match offsets.runtime_state.interpreters_main {
                Some(o) if self.config.runtime_relative_address != 0 => {
                    BINARY_BASE + self.config.runtime_relative_address + o as u64
                }
                _ => BINARY_BASE + self.config.interp_head_relative_address,
            };
            self.mem.write_u64(slot, interp);
            interp
        }

        pub fn set_tss_key(&mut self, key: i32, initialized: bool) {
            let tss = self.config.offsets.tss;
            let base = BINARY_BASE + self.config.auto_tss_key_relative_address;
            if let Some(o) = tss.is_initialized {
                self.mem.write_u32(base + o as u64, initialized as u32);
            }
            self.mem.write_i32(base + tss.key.unwrap_or(0) as u64, key);
        }

        /// A thread control block with readable memory on both sides.
        pub fn tcb(&mut self) -> u64 {
            self.mem.alloc(0x2000) + 0x1000
        }

        pub fn set_static_tls(&mut self, tcb: u64, thread_state: u64) {
            self.mem
                .write_u64(tcb - self.config.thread_state_tls_offset, thread_state);
        }

        /// Store `value` in the inline pthread specific block of `tcb`.
        pub fn set_pthread_specific(&mut self, tcb: u64, key: u32, value: u64) {
            let config = pthread_config();
            let pthread = self.mem.alloc(0x800);
            self.mem
                .write_u64(tcb + config.struct_pthread_pointer_offset, pthread);
            let slot = pthread
                + config.first_specific_block_offset
                + key as u64 * config.key_data.size
                + config.key_data.value_offset;
            self.mem.write_u64(slot, value);
        }
    }
}
