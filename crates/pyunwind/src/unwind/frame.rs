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

use log::trace;

use crate::remote_memory::ReadMemory;
use crate::stats::UnwinderCounter;

use super::python::{FrameOffsets, FrameOwner, PythonConfig, UnwindState, PYTHON_MAX_STACK_DEPTH};
use super::symbol::{SymbolKey, SymbolResolver};

/// Read the innermost frame of a thread state, 0 included.
///
/// Interpreters with a `_PyCFrame` keep the current frame one pointer away
/// from the thread state, older ones store it on the thread state directly.
pub fn read_current_frame<M: ReadMemory>(
    mem: &M,
    config: &PythonConfig,
    thread_state: u64,
    counter: &UnwinderCounter,
) -> Option<u64> {
    if thread_state == 0 {
        return None;
    }
    let offsets = &config.offsets;
    let (base, current_frame) = match offsets.thread_state.cframe {
        Some(cframe) => {
            let cframe = match mem.read_ptr(thread_state.wrapping_add(cframe as u64)) {
                Ok(p) => p,
                Err(e) => {
                    UnwinderCounter::inc(&counter.read_cframe_error);
                    trace!("python: failed to read cframe: {e}");
                    return None;
                }
            };
            (cframe, offsets.cframe.current_frame?)
        }
        None => (thread_state, offsets.thread_state.current_frame?),
    };
    if base == 0 {
        UnwinderCounter::inc(&counter.cframe_null);
        return None;
    }

    match mem.read_ptr(base.wrapping_add(current_frame as u64)) {
        Ok(0) => {
            UnwinderCounter::inc(&counter.current_frame_null);
            Some(0)
        }
        Ok(frame) => Some(frame),
        Err(e) => {
            UnwinderCounter::inc(&counter.read_current_frame_error);
            trace!("python: failed to read current frame at {:#x}: {e}", base);
            None
        }
    }
}

fn read_frame_owner<M: ReadMemory>(
    mem: &M,
    offsets: &FrameOffsets,
    frame: u64,
    counter: &UnwinderCounter,
) -> Option<FrameOwner> {
    let Some(owner) = offsets.owner else {
        return Some(FrameOwner::Thread);
    };
    match mem.read_u8(frame.wrapping_add(owner as u64)) {
        // owners this walker does not know about still run python code
        Ok(v) => Some(FrameOwner::try_from(v).unwrap_or(FrameOwner::Thread)),
        Err(e) => {
            UnwinderCounter::inc(&counter.read_frame_owner_error);
            trace!("python: failed to read frame owner: {e}");
            None
        }
    }
}

fn read_previous_frame<M: ReadMemory>(
    mem: &M,
    offsets: &FrameOffsets,
    frame: u64,
    counter: &UnwinderCounter,
) -> Option<u64> {
    match mem.read_ptr(frame.wrapping_add(offsets.previous as u64)) {
        Ok(p) => Some(p),
        Err(e) => {
            UnwinderCounter::inc(&counter.read_previous_frame_error);
            trace!("python: failed to read previous frame: {e}");
            None
        }
    }
}

/// Collect at most `max_depth` frames starting at `frame` into `state`.
///
/// Cyclic previous links are only bounded by the depth. Whatever was
/// collected before a failed read is kept.
pub fn walk_stack<M: ReadMemory>(
    resolver: &SymbolResolver<'_, M>,
    mut frame: u64,
    max_depth: usize,
    state: &mut UnwindState,
) {
    let mem = resolver.mem;
    let counter = resolver.counter;
    let offsets = &resolver.config.offsets.frame;

    for _ in 0..max_depth.min(PYTHON_MAX_STACK_DEPTH) {
        if frame == 0 {
            break;
        }

        let Some(owner) = read_frame_owner(mem, offsets, frame, counter) else {
            break;
        };

        if owner == FrameOwner::CStack {
            trace!("python: frame owned by c stack");
            UnwinderCounter::inc(&counter.stub_frames);
            state.push(SymbolKey::STUB);
        } else {
            let code = match mem.read_ptr(frame.wrapping_add(offsets.f_code as u64)) {
                Ok(0) => {
                    trace!("python: read NULL code object");
                    break;
                }
                Ok(c) => c,
                Err(e) => {
                    UnwinderCounter::inc(&counter.read_code_object_error);
                    trace!("python: failed to read code object: {e}");
                    break;
                }
            };
            if let Some(key) = resolver.resolve(state.pid, code, &mut state.symbol_buffer) {
                state.push(key);
            }
        }

        match read_previous_frame(mem, offsets, frame, counter) {
            Some(prev) => frame = prev,
            None => {
                frame = 0;
                break;
            }
        }
    }

    if frame != 0 {
        UnwinderCounter::inc(&counter.truncated_stacks);
    }
    UnwinderCounter::add(&counter.collected_frames, state.frame_count as u64);
    trace!("python: collected {} frames", state.frame_count);
}
