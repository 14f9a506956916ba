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

pub mod error;
pub mod maps;
pub mod remote_memory;
pub mod stats;
pub mod unwind;

pub use error::{Error, Result};
pub use remote_memory::{Fault, ReadMemory, RemoteMemory};
pub use unwind::{
    process::{ProcessInfo, SampleContext},
    pthread::PthreadConfig,
    python::{PythonConfig, PythonInternalsOffsets, UnwindState},
    symbol::{Symbol, SymbolKey},
    symbolizer::{DecodedSymbol, Symbolizer},
    PythonUnwinder, UnwinderConfig,
};
