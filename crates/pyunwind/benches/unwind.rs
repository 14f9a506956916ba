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

use criterion::*;
use pyunwind::unwind::process::{BinaryBinding, UnwindType};
use pyunwind::unwind::python::{encode_version, scan_version};
use pyunwind::{
    Fault, ProcessInfo, PythonConfig, PythonInternalsOffsets, PythonUnwinder, ReadMemory,
    SampleContext, UnwindState,
};

const BASE: u64 = 0x1000_0000;
const PID: u32 = 1000;
const TCB: u64 = 0x7f00_dead_b000;
const DEPTH: u64 = 64;

const OFFSETS_JSON: &str = r#"{
    "PyThreadState": {"prev": 0, "next": 8, "frame": 24, "thread_id": 176},
    "PyInterpreterState": {"next": 0, "tstate_head": 8},
    "PyFrameObject": {"f_back": 24, "f_code": 32},
    "PyCodeObject": {"co_firstlineno": 40, "co_filename": 104, "co_name": 112},
    "PyASCIIObject": {"length": 16, "state": 32, "data": 48}
}"#;

/// A python 3.10 heap laid out in one contiguous image.
struct Image {
    data: Vec<u8>,
}

impl Image {
    fn write(&mut self, address: u64, bytes: &[u8]) {
        let offset = (address - BASE) as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn write_u64(&mut self, address: u64, value: u64) {
        self.write(address, &value.to_ne_bytes());
    }

    fn string(&mut self, address: u64, s: &str) {
        self.write_u64(address + 16, s.len() as u64);
        self.write(address + 32, &((1u32 << 6) | (1 << 5)).to_ne_bytes());
        self.write(address + 48, s.as_bytes());
    }

    fn build() -> Self {
        let mut image = Image {
            data: vec![0; 0x20000],
        };
        let interp = BASE + 0x100;
        let thread_state = BASE + 0x200;
        image.write_u64(BASE + 0x10, interp);
        image.write_u64(interp + 8, thread_state);
        image.write_u64(thread_state + 176, TCB);

        let mut previous = 0;
        for i in 0..DEPTH {
            let frame = BASE + 0x1000 + i * 0x80;
            let code = BASE + 0x4000 + i * 0x100;
            let name = BASE + 0x10000 + i * 0x100;
            let filename = name + 0x80;
            image.string(name, &format!("function_{i}"));
            image.string(filename, "/srv/bench.py");
            image.write(code + 40, &(i as i32 + 1).to_ne_bytes());
            image.write_u64(code + 104, filename);
            image.write_u64(code + 112, name);
            image.write_u64(frame + 24, previous);
            image.write_u64(frame + 32, code);
            previous = frame;
        }
        image.write_u64(thread_state + 24, previous);
        image
    }
}

impl ReadMemory for Image {
    fn read_at(&self, address: u64, buffer: &mut [u8]) -> Result<(), Fault> {
        let fault = Fault::new(address, buffer.len());
        let offset = address.checked_sub(BASE).ok_or(fault)? as usize;
        let src = self
            .data
            .get(offset..offset + buffer.len())
            .ok_or(fault)?;
        buffer.copy_from_slice(src);
        Ok(())
    }
}

fn setup() -> (Image, ProcessInfo, PythonUnwinder) {
    let config = PythonConfig {
        interp_head_relative_address: 0x10,
        version: encode_version(&scan_version("3.10.12").unwrap()),
        offsets: PythonInternalsOffsets::from_offsets_json(OFFSETS_JSON).unwrap(),
        ..Default::default()
    };
    let info = ProcessInfo {
        pid: PID,
        unwind_type: UnwindType::FramePointer,
        main_binary_id: 1,
        interpreter_binary: Some(BinaryBinding {
            id: 1,
            start_address: BASE,
        }),
        pthread_binary: None,
    };
    let unwinder = PythonUnwinder::default();
    unwinder.python_configs().add(1, config);
    (Image::build(), info, unwinder)
}

fn python_unwind(c: &mut Criterion) {
    let ctx = SampleContext {
        pid: PID,
        tid: PID,
        tcb: TCB,
    };

    c.bench_function("python-collect-stack", |b| {
        let (image, info, unwinder) = setup();
        let mut state = Box::<UnwindState>::default();
        b.iter(|| {
            let n = unwinder.collect_stack(&image, &info, &ctx, &mut state);
            assert_eq!(n, DEPTH as usize);
        })
    });

    c.bench_function("python-collect-and-symbolize", |b| {
        let (image, info, unwinder) = setup();
        let symbolizer = unwinder.symbolizer();
        let mut state = Box::<UnwindState>::default();
        b.iter(|| {
            unwinder.collect_stack(&image, &info, &ctx, &mut state);
            for key in state.frames() {
                black_box(symbolizer.symbolize(key));
            }
        })
    });
}

criterion_group!(benches, python_unwind);
criterion_main!(benches);
