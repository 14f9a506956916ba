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

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterType {
    Counted,
    Gauged,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

pub type Counter = (&'static str, CounterType, CounterValue);

pub trait RefCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
}

/// Sample-time failure and progress counters of the python unwinder.
///
/// Counters are bumped with relaxed ordering from every sampling thread and
/// reset to zero when collected.
#[derive(Debug, Default)]
pub struct UnwinderCounter {
    pub processed_stacks: AtomicU64,
    pub no_config: AtomicU64,
    pub read_tls_thread_state_error: AtomicU64,
    pub read_tss_key_error: AtomicU64,
    pub read_thread_id_error: AtomicU64,
    pub thread_state_not_found: AtomicU64,
    pub thread_state_cache_hit: AtomicU64,
    pub read_cframe_error: AtomicU64,
    pub cframe_null: AtomicU64,
    pub read_current_frame_error: AtomicU64,
    pub current_frame_null: AtomicU64,
    pub read_frame_owner_error: AtomicU64,
    pub read_previous_frame_error: AtomicU64,
    pub read_code_object_error: AtomicU64,
    pub read_first_lineno_error: AtomicU64,
    pub non_ascii_compact_strings: AtomicU64,
    pub failed_to_read_symbol: AtomicU64,
    pub symbol_cache_hit: AtomicU64,
    pub symbol_cache_miss: AtomicU64,
    pub stub_frames: AtomicU64,
    pub collected_frames: AtomicU64,
    pub truncated_stacks: AtomicU64,
}

impl UnwinderCounter {
    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

macro_rules! counted {
    ($self:ident, $($name:literal => $field:ident),+ $(,)?) => {
        vec![$((
            $name,
            CounterType::Counted,
            CounterValue::Unsigned($self.$field.swap(0, Ordering::Relaxed)),
        )),+]
    };
}

impl RefCountable for UnwinderCounter {
    fn get_counters(&self) -> Vec<Counter> {
        counted!(self,
            "processed-stacks" => processed_stacks,
            "no-config" => no_config,
            "read-tls-thread-state-error" => read_tls_thread_state_error,
            "read-tss-key-error" => read_tss_key_error,
            "read-thread-id-error" => read_thread_id_error,
            "thread-state-not-found" => thread_state_not_found,
            "thread-state-cache-hit" => thread_state_cache_hit,
            "read-cframe-error" => read_cframe_error,
            "cframe-null" => cframe_null,
            "read-current-frame-error" => read_current_frame_error,
            "current-frame-null" => current_frame_null,
            "read-frame-owner-error" => read_frame_owner_error,
            "read-previous-frame-error" => read_previous_frame_error,
            "read-code-object-error" => read_code_object_error,
            "read-first-lineno-error" => read_first_lineno_error,
            "non-ascii-compact-strings" => non_ascii_compact_strings,
            "failed-to-read-symbol" => failed_to_read_symbol,
            "symbol-cache-hit" => symbol_cache_hit,
            "symbol-cache-miss" => symbol_cache_miss,
            "stub-frames" => stub_frames,
            "collected-frames" => collected_frames,
            "truncated-stacks" => truncated_stacks,
        )
    }
}
