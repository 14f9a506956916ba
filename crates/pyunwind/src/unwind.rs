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

pub mod cache;
pub mod frame;
pub mod process;
pub mod pthread;
pub mod python;
pub mod storage;
pub mod symbol;
pub mod symbolizer;
pub mod thread_state;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use log::{debug, trace};
use serde::Deserialize;

use crate::remote_memory::ReadMemory;
use crate::stats::UnwinderCounter;

use process::{ProcessInfo, SampleContext, UnwindType};
use pthread::PthreadConfig;
use python::{
    PythonConfig, UnwindState, MAX_PYTHON_SYMBOLS_SIZE, MAX_PYTHON_THREADS,
    MAX_PYTHON_THREAD_STATE_WALK, PYTHON_MAX_STACK_DEPTH,
};
use storage::ConfigStorage;
use symbol::{SymbolCache, SymbolResolver};
use symbolizer::{
    new_decoded_cache, DecodedSymbolCache, Symbolizer, DEFAULT_SYMBOLIZER_CACHE_SIZE,
};
use thread_state::{RuntimeAddresses, ThreadStateCache, ThreadStateResolver};

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct UnwinderConfig {
    pub max_stack_depth: usize,
    pub max_thread_state_walk: usize,
    pub thread_state_cache_size: usize,
    pub symbol_cache_size: usize,
    pub symbolizer_cache_size: usize,
}

impl Default for UnwinderConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: PYTHON_MAX_STACK_DEPTH,
            max_thread_state_walk: MAX_PYTHON_THREAD_STATE_WALK,
            thread_state_cache_size: MAX_PYTHON_THREADS,
            symbol_cache_size: MAX_PYTHON_SYMBOLS_SIZE,
            symbolizer_cache_size: DEFAULT_SYMBOLIZER_CACHE_SIZE,
        }
    }
}

impl UnwinderConfig {
    /// Clamp walk bounds into what the fixed size state can hold.
    pub fn normalize(&mut self) {
        if self.max_stack_depth == 0 || self.max_stack_depth > PYTHON_MAX_STACK_DEPTH {
            debug!(
                "max-stack-depth {} out of range, use {}",
                self.max_stack_depth, PYTHON_MAX_STACK_DEPTH
            );
            self.max_stack_depth = PYTHON_MAX_STACK_DEPTH;
        }
        if self.max_thread_state_walk == 0 {
            self.max_thread_state_walk = MAX_PYTHON_THREAD_STATE_WALK;
        }
    }
}

/// Python stack collection shared by every sampling thread.
pub struct PythonUnwinder {
    config: UnwinderConfig,
    python_configs: ConfigStorage<PythonConfig>,
    pthread_configs: ConfigStorage<PthreadConfig>,
    thread_states: ThreadStateCache,
    symbols: Arc<SymbolCache>,
    decoded_symbols: Arc<DecodedSymbolCache>,
    counter: Arc<UnwinderCounter>,
}

impl Default for PythonUnwinder {
    fn default() -> Self {
        Self::new(UnwinderConfig::default())
    }
}

impl PythonUnwinder {
    pub fn new(mut config: UnwinderConfig) -> Self {
        config.normalize();
        Self {
            python_configs: ConfigStorage::new("python"),
            pthread_configs: ConfigStorage::new("pthread"),
            thread_states: ThreadStateCache::new(config.thread_state_cache_size),
            symbols: Arc::new(SymbolCache::new(config.symbol_cache_size)),
            decoded_symbols: Arc::new(new_decoded_cache(config.symbolizer_cache_size)),
            counter: Arc::new(UnwinderCounter::default()),
            config,
        }
    }

    pub fn config(&self) -> &UnwinderConfig {
        &self.config
    }

    pub fn python_configs(&self) -> &ConfigStorage<PythonConfig> {
        &self.python_configs
    }

    pub fn pthread_configs(&self) -> &ConfigStorage<PthreadConfig> {
        &self.pthread_configs
    }

    pub fn thread_states(&self) -> &ThreadStateCache {
        &self.thread_states
    }

    pub fn symbols(&self) -> &Arc<SymbolCache> {
        &self.symbols
    }

    pub fn counter(&self) -> Arc<UnwinderCounter> {
        self.counter.clone()
    }

    /// Symbolizers of one unwinder share their decoded symbols.
    pub fn symbolizer(&self) -> Symbolizer {
        Symbolizer::with_cache(self.symbols.clone(), self.decoded_symbols.clone())
    }

    /// Unwind the python stack of one sample into `state`.
    ///
    /// Returns the number of frames collected. Zero frames and truncated
    /// stacks are normal results, failures only show up in the counters.
    pub fn collect_stack<M: ReadMemory>(
        &self,
        mem: &M,
        proc_info: &ProcessInfo,
        ctx: &SampleContext,
        state: &mut UnwindState,
    ) -> usize {
        state.reset(ctx.pid);
        if proc_info.unwind_type == UnwindType::Disabled {
            return 0;
        }
        let Some(interpreter) = proc_info.interpreter_binary else {
            return 0;
        };
        let Some(config) = self.python_configs.get(interpreter.id) else {
            UnwinderCounter::inc(&self.counter.no_config);
            return 0;
        };
        let pthread_config = proc_info
            .pthread_binary
            .and_then(|b| self.pthread_configs.get(b.id));
        UnwinderCounter::inc(&self.counter.processed_stacks);

        let relocate = |relative: u64| {
            if relative == 0 {
                0
            } else {
                interpreter.start_address.wrapping_add(relative)
            }
        };
        let resolver = ThreadStateResolver {
            mem,
            config: &config,
            pthread_config: pthread_config.as_deref(),
            addresses: RuntimeAddresses {
                runtime: relocate(config.runtime_relative_address),
                interp_head: relocate(config.interp_head_relative_address),
                auto_tss_key: relocate(config.auto_tss_key_relative_address),
            },
            cache: &self.thread_states,
            counter: &self.counter,
            max_walk: self.config.max_thread_state_walk,
        };
        let Some(thread_state) = resolver.resolve(ctx) else {
            UnwinderCounter::inc(&self.counter.thread_state_not_found);
            trace!("python: no PyThreadState for process#{} thread {}", ctx.pid, ctx.tid);
            return 0;
        };
        trace!("python: PyThreadState at {:#x}", thread_state);

        let current_frame = frame::read_current_frame(mem, &config, thread_state, &self.counter);
        let Some(current_frame) = current_frame else {
            return 0;
        };

        let symbols = SymbolResolver {
            mem,
            config: &config,
            cache: &self.symbols,
            counter: &self.counter,
        };
        frame::walk_stack(&symbols, current_frame, self.config.max_stack_depth, state);
        state.frame_count
    }

    /// Forget everything cached for an exited process.
    pub fn unload(&self, pid: u32) {
        trace!("unload python unwind info for process#{pid}");
        self.thread_states.retain(|key| key.pid != pid);
        self.symbols.retain(|key| key.pid != pid);
        self.decoded_symbols.retain(|key| key.pid != pid);
    }
}
