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

//! Finding the `PyThreadState` of a sampled thread.
//!
//! The pointer comes from static TLS when the offset is known, otherwise from
//! the `autoTSSkey` pthread slot. Every sample also walks the interpreter's
//! thread list and refreshes the process wide thread state cache, which is
//! the last resort when neither TLS path works.

use log::trace;

use crate::remote_memory::ReadMemory;
use crate::stats::UnwinderCounter;

use super::cache::LruMap;
use super::process::SampleContext;
use super::pthread::{read_tss, PthreadConfig};
use super::python::PythonConfig;

/// Identifies a python thread within a process.
///
/// `thread_id` is the innermost namespace tid on runtimes recording
/// `native_thread_id`, and the `pthread_t` (the TCB on x86_64 glibc) before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey {
    pub pid: u32,
    pub thread_id: u64,
}

pub type ThreadStateCache = LruMap<ThreadKey, u64>;

/// Runtime singletons of one process, 0 when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeAddresses {
    pub runtime: u64,
    pub interp_head: u64,
    pub auto_tss_key: u64,
}

pub struct ThreadStateResolver<'a, M> {
    pub mem: &'a M,
    pub config: &'a PythonConfig,
    pub pthread_config: Option<&'a PthreadConfig>,
    pub addresses: RuntimeAddresses,
    pub cache: &'a ThreadStateCache,
    pub counter: &'a UnwinderCounter,
    pub max_walk: usize,
}

impl<'a, M: ReadMemory> ThreadStateResolver<'a, M> {
    /// Resolve the thread state of the sampled thread, refreshing the cache.
    pub fn resolve(&self, ctx: &SampleContext) -> Option<u64> {
        let candidate = self.read_from_tls(ctx.tcb).filter(|p| *p != 0);
        trace!("python: read PyThreadState from TLS: {:?}", candidate);

        if let Some(start) = self.head_thread_state().or(candidate) {
            self.fill_threads_cache(ctx.pid, start);
        }

        if candidate.is_some() {
            return candidate;
        }

        let key = self.current_thread_key(ctx)?;
        match self.cache.get(&key) {
            Some(thread_state) => {
                UnwinderCounter::inc(&self.counter.thread_state_cache_hit);
                trace!(
                    "python: retrieved PyThreadState {:#x} for process#{} thread {}",
                    thread_state,
                    key.pid,
                    key.thread_id
                );
                Some(thread_state)
            }
            None => {
                trace!(
                    "python: no PyThreadState for process#{} thread {}",
                    key.pid,
                    key.thread_id
                );
                None
            }
        }
    }

    /// The cache key of the sampled thread.
    pub fn current_thread_key(&self, ctx: &SampleContext) -> Option<ThreadKey> {
        let thread_id = if self.config.offsets.thread_state.native_thread_id.is_some() {
            ctx.tid as u64
        } else {
            ctx.tcb
        };
        if thread_id == 0 {
            return None;
        }
        Some(ThreadKey {
            pid: ctx.pid,
            thread_id,
        })
    }

    fn read_from_tls(&self, tcb: u64) -> Option<u64> {
        if tcb == 0 {
            return None;
        }
        if self.config.thread_state_tls_offset != 0 {
            return self.read_static_tls(tcb);
        }
        let pthread_config = self.pthread_config?;
        let key = self.read_tss_key()?;
        read_tss(self.mem, pthread_config, tcb, key)
    }

    fn read_static_tls(&self, tcb: u64) -> Option<u64> {
        let address = tcb.wrapping_sub(self.config.thread_state_tls_offset);
        match self.mem.read_ptr(address) {
            Ok(p) => Some(p),
            Err(e) => {
                UnwinderCounter::inc(&self.counter.read_tls_thread_state_error);
                trace!("python: failed to read thread local PyThreadState: {e}");
                None
            }
        }
    }

    fn read_tss_key(&self) -> Option<u32> {
        let base = self.addresses.auto_tss_key;
        if base == 0 {
            trace!("python: no auto tss key address");
            return None;
        }
        let tss = &self.config.offsets.tss;

        if let Some(offset) = tss.is_initialized {
            match self.mem.read_u32(base.wrapping_add(offset as u64)) {
                Ok(0) => {
                    trace!("python: tss key at {:#x} is not initialized", base);
                    return None;
                }
                Ok(_) => (),
                Err(e) => {
                    UnwinderCounter::inc(&self.counter.read_tss_key_error);
                    trace!("python: failed to read tss is_initialized: {e}");
                    return None;
                }
            }
        }

        let address = base.wrapping_add(tss.key.unwrap_or(0) as u64);
        match self.mem.read_i32(address) {
            Ok(key) if key >= 0 => Some(key as u32),
            Ok(key) => {
                trace!("python: invalid tss key {key}");
                None
            }
            Err(e) => {
                UnwinderCounter::inc(&self.counter.read_tss_key_error);
                trace!("python: failed to read tss key: {e}");
                None
            }
        }
    }

    fn main_interpreter_address(&self) -> u64 {
        match self.config.offsets.runtime_state.interpreters_main {
            Some(offset) if self.addresses.runtime != 0 => {
                self.addresses.runtime.wrapping_add(offset as u64)
            }
            _ => self.addresses.interp_head,
        }
    }

    /// Head of the main interpreter's thread list.
    pub fn head_thread_state(&self) -> Option<u64> {
        let address = self.main_interpreter_address();
        if address == 0 {
            return None;
        }
        let interp = match self.mem.read_ptr(address) {
            Ok(0) => return None,
            Ok(p) => p,
            Err(e) => {
                trace!("python: failed to read main PyInterpreterState: {e}");
                return None;
            }
        };
        let offset = self.config.offsets.interpreter_state.threads_head;
        match self.mem.read_ptr(interp.wrapping_add(offset as u64)) {
            Ok(0) => None,
            Ok(head) => {
                trace!("python: head PyThreadState {:#x} of PyInterpreterState {:#x}", head, interp);
                Some(head)
            }
            Err(e) => {
                trace!("python: failed to read head PyThreadState: {e}");
                None
            }
        }
    }

    fn read_thread_id(&self, thread_state: u64) -> u64 {
        let offsets = &self.config.offsets.thread_state;
        let Some(offset) = offsets.native_thread_id.or(offsets.thread_id) else {
            return 0;
        };
        match self.mem.read_u64(thread_state.wrapping_add(offset as u64)) {
            Ok(id) => id,
            Err(e) => {
                UnwinderCounter::inc(&self.counter.read_thread_id_error);
                trace!("python: failed to read thread id: {e}");
                0
            }
        }
    }

    fn upsert(&self, pid: u32, thread_state: u64) {
        let thread_id = self.read_thread_id(thread_state);
        if thread_id == 0 {
            return;
        }
        self.cache.insert(ThreadKey { pid, thread_id }, thread_state);
        trace!("python: upserted PyThreadState {:#x} for thread {}", thread_state, thread_id);
    }

    /// Walk both directions of the thread list from `start`, each bounded.
    pub fn fill_threads_cache(&self, pid: u32, start: u64) {
        let offsets = &self.config.offsets.thread_state;
        for link in [offsets.next_thread, offsets.prev_thread] {
            let mut current = start;
            for _ in 0..self.max_walk {
                if current == 0 {
                    break;
                }
                self.upsert(pid, current);
                current = match self.mem.read_ptr(current.wrapping_add(link as u64)) {
                    Ok(p) => p,
                    Err(e) => {
                        trace!("python: failed to read sibling PyThreadState: {e}");
                        break;
                    }
                };
            }
        }
    }
}
