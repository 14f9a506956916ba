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

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use ahash::AHashMap;
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};

use pyunwind::maps::discover_process;
use pyunwind::stats::{CounterValue, RefCountable};
use pyunwind::{
    ProcessInfo, PythonUnwinder, RemoteMemory, SampleContext, SymbolKey, Symbolizer, UnwindState,
};

use crate::config::Config;

pub const NATIVE_FRAME: &str = "[native]";
pub const UNKNOWN_FRAME: &str = "[unknown]";

/// Periodically samples every thread of one python process and aggregates
/// the stacks in folded form.
pub struct Sampler {
    config: Config,
    process: ProcessInfo,
    mem: RemoteMemory,
    unwinder: PythonUnwinder,
    symbolizer: Symbolizer,
    state: Box<UnwindState>,
    stacks: AHashMap<String, u64>,
}

pub fn list_threads(pid: u32) -> io::Result<Vec<u32>> {
    let path: PathBuf = ["/proc", &pid.to_string(), "task"].iter().collect();
    let mut tids = vec![];
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

/// Outermost frame first, separated by `;`.
pub fn fold_stack(frames: &[SymbolKey], symbolizer: &Symbolizer) -> String {
    let names: Vec<String> = frames
        .iter()
        .rev()
        .map(|key| {
            if key.is_stub() {
                return NATIVE_FRAME.to_owned();
            }
            match symbolizer.symbolize(key) {
                Some(symbol) if !symbol.name.is_empty() => symbol.name.clone(),
                _ => UNKNOWN_FRAME.to_owned(),
            }
        })
        .collect();
    names.join(";")
}

impl Sampler {
    pub fn new(config: Config) -> Result<Self> {
        config.check()?;
        let pid = config.pid;
        let process =
            discover_process(pid).with_context(|| format!("discover process#{pid}"))?;
        let interpreter = process
            .interpreter_binary
            .ok_or_else(|| anyhow!("process#{pid} has no python binary mapped"))?;

        let unwinder = PythonUnwinder::new(config.unwinder.clone());
        let python = config.python.build()?;
        if python.offsets.thread_state.native_thread_id.is_none() {
            warn!(
                "python v{} records no native thread ids, samples of process#{pid} need a TCB",
                python.version()
            );
        }
        unwinder.python_configs().add(interpreter.id, python);
        match (config.pthread, process.pthread_binary) {
            (Some(pthread), Some(binary)) => {
                unwinder.pthread_configs().add(binary.id, pthread);
            }
            (Some(_), None) => warn!("process#{pid} has no pthread binary mapped"),
            _ => (),
        }
        info!(
            "attached to process#{pid}, python binary {:#x} loaded at {:#x}",
            interpreter.id, interpreter.start_address
        );

        let symbolizer = unwinder.symbolizer();
        Ok(Self {
            mem: RemoteMemory::new(pid),
            process,
            unwinder,
            symbolizer,
            state: Box::default(),
            stacks: AHashMap::new(),
            config,
        })
    }

    /// Sample every thread once. Returns false once the process is gone.
    pub fn sample_once(&mut self) -> bool {
        let pid = self.config.pid;
        let tids = match list_threads(pid) {
            Ok(tids) => tids,
            Err(e) => {
                info!("process#{pid} exited: {e}");
                self.unwinder.unload(pid);
                return false;
            }
        };
        for tid in tids {
            // TCBs are not known from user space
            let ctx = SampleContext { pid, tid, tcb: 0 };
            let n = self
                .unwinder
                .collect_stack(&self.mem, &self.process, &ctx, &mut self.state);
            if n == 0 {
                continue;
            }
            let folded = fold_stack(self.state.frames(), &self.symbolizer);
            debug!("process#{pid} thread {tid}: {folded}");
            *self.stacks.entry(folded).or_default() += 1;
        }
        true
    }

    /// Sample until `sample_count` rounds are done, the process exits or
    /// `terminated` is set.
    pub fn run(&mut self, terminated: &AtomicBool) {
        for _ in 0..self.config.sample_count {
            if terminated.load(Ordering::Relaxed) || !self.sample_once() {
                break;
            }
            thread::sleep(self.config.sample_interval);
        }
    }

    pub fn stacks(&self) -> &AHashMap<String, u64> {
        &self.stacks
    }

    /// Write folded stacks, one `a;b;c count` per line, and log counters.
    pub fn report<W: Write>(&self, mut out: W) -> io::Result<()> {
        let mut stacks: Vec<_> = self.stacks.iter().collect();
        stacks.sort();
        for (stack, count) in stacks {
            writeln!(out, "{stack} {count}")?;
        }
        out.flush()?;

        let counters = self
            .unwinder
            .counter()
            .get_counters()
            .into_iter()
            .chain(self.symbolizer.get_counters());
        for (name, _, value) in counters {
            match value {
                CounterValue::Unsigned(0) => (),
                CounterValue::Unsigned(v) => info!("{name}: {v}"),
                other => info!("{name}: {other:?}"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pyunwind::unwind::symbol::SymbolCache;
    use pyunwind::Symbol;

    use super::*;

    fn key(code_object: u64) -> SymbolKey {
        SymbolKey {
            code_object,
            pid: 1,
            first_lineno: 1,
        }
    }

    #[test]
    fn fold_outermost_first() {
        let symbols = Arc::new(SymbolCache::new(8));
        for (code, name) in [(1, "main"), (2, "handle")] {
            symbols.insert(
                key(code),
                Arc::new(Symbol {
                    codepoint_size: 1,
                    name_length: name.len() as u16,
                    filename_length: 0,
                    data: name.as_bytes().to_vec(),
                }),
            );
        }
        let symbolizer = Symbolizer::new(symbols, 0);

        // innermost first, as collected
        let frames = [key(2), SymbolKey::STUB, key(1), key(3)];
        assert_eq!(
            fold_stack(&frames, &symbolizer),
            "[unknown];main;[native];handle"
        );
    }

    #[test]
    fn list_own_threads() {
        let tids = list_threads(std::process::id()).unwrap();
        assert!(tids.contains(&std::process::id()));
    }
}
