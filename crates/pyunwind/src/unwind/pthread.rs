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

//! Userspace `pthread_getspecific` for glibc targets.
//!
//! glibc keeps the first `PTHREAD_KEY_2NDLEVEL_SIZE` values inline in
//! `struct pthread` (`specific_1stblock`) and the rest in lazily allocated
//! second level blocks reached through `specific[]`.

use log::trace;
use serde::{Deserialize, Serialize};

use crate::remote_memory::ReadMemory;

const POINTER_SIZE: u64 = 8;

/// Layout of `struct pthread_key_data`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PthreadKeyData {
    pub size: u64,
    pub value_offset: u64,
    pub seq_offset: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PthreadConfig {
    pub key_data: PthreadKeyData,
    pub first_specific_block_offset: u64,
    pub specific_array_offset: u64,
    /// Offset of the `struct pthread` self pointer from the thread control block.
    pub struct_pthread_pointer_offset: u64,
    pub key_second_level_size: u64,
    pub key_first_level_size: u64,
    pub keys_max: u64,
}

fn read_second_level<M: ReadMemory>(
    mem: &M,
    key_data: &PthreadKeyData,
    block: u64,
    index: u64,
) -> Option<u64> {
    let address = block
        .wrapping_add(index.wrapping_mul(key_data.size))
        .wrapping_add(key_data.value_offset);
    match mem.read_ptr(address) {
        Ok(value) => {
            trace!("pthread: read value {:#x}", value);
            Some(value)
        }
        Err(e) => {
            trace!("pthread: failed to read value: {e}");
            None
        }
    }
}

/// Look up the value of `key` in the thread whose control block is at `tcb`.
///
/// Any unreadable or null intermediate pointer yields `None`. A null value is
/// returned as `Some(0)`, callers decide what an unset slot means.
pub fn read_tss<M: ReadMemory>(mem: &M, config: &PthreadConfig, tcb: u64, key: u32) -> Option<u64> {
    let key = key as u64;
    let pthread = match mem.read_ptr(tcb.wrapping_add(config.struct_pthread_pointer_offset)) {
        Ok(p) => p,
        Err(e) => {
            trace!("pthread: failed to read pthread pointer: {e}");
            return None;
        }
    };
    if pthread == 0 {
        trace!("pthread: pthread pointer is NULL");
        return None;
    }
    if key >= config.keys_max || config.key_second_level_size == 0 {
        trace!("pthread: key {key} is out of range, max {}", config.keys_max);
        return None;
    }

    if key < config.key_second_level_size {
        return read_second_level(
            mem,
            &config.key_data,
            pthread.wrapping_add(config.first_specific_block_offset),
            key,
        );
    }

    let index = key / config.key_second_level_size;
    let slot = pthread
        .wrapping_add(config.specific_array_offset)
        .wrapping_add(index * POINTER_SIZE);
    let block = match mem.read_ptr(slot) {
        Ok(0) => return None,
        Ok(b) => b,
        Err(e) => {
            trace!("pthread: failed to read second level block: {e}");
            return None;
        }
    };
    read_second_level(
        mem,
        &config.key_data,
        block,
        key % config.key_second_level_size,
    )
}
