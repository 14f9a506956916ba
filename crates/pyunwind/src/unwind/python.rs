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

use std::{cell::OnceCell, collections::HashMap, fs, path::Path};

use log::{debug, trace};
use num_enum::TryFromPrimitive;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::symbol::SymbolKey;

pub const MAX_PYTHON_THREADS: usize = 16384;
pub const MAX_PYTHON_THREAD_STATE_WALK: usize = 32;
pub const PYTHON_MAX_STACK_DEPTH: usize = 128;
// must be a power of 2
pub const PYTHON_SYMBOL_BUFFER_SIZE: usize = 1024;
pub const PYTHON_STRING_LENGTH_MASK: usize = PYTHON_SYMBOL_BUFFER_SIZE - 1;
pub const MAX_PYTHON_SYMBOLS_SIZE: usize = 200000;
pub const PYTHON_CFRAME_LINENO_ID: i32 = -1;

const DEFAULT_ASCII_BIT: u8 = 6;
const DEFAULT_COMPACT_BIT: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameOwner {
    Thread = 0,
    Generator = 1,
    FrameObject = 2,
    CStack = 3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RuntimeStateOffsets {
    pub interpreters_main: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ThreadStateOffsets {
    /// Present from 3.11 where the current frame hangs off a `_PyCFrame`.
    pub cframe: Option<u32>,
    /// Current frame on the thread state itself, `frame` before 3.11.
    pub current_frame: Option<u32>,
    /// pthread identifier
    pub thread_id: Option<u32>,
    /// Innermost namespace OS thread id, 3.11+.
    pub native_thread_id: Option<u32>,
    pub prev_thread: u32,
    pub next_thread: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CframeOffsets {
    pub current_frame: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FrameOffsets {
    pub f_code: u32,
    pub previous: u32,
    /// Absent before 3.11.4, every frame is then owned by its thread.
    pub owner: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InterpreterStateOffsets {
    pub threads_head: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CodeObjectOffsets {
    pub co_firstlineno: u32,
    pub filename: u32,
    /// `co_qualname`, or `co_name` for runtimes without qualified names.
    pub qualname: u32,
}

fn default_ascii_bit() -> u8 {
    DEFAULT_ASCII_BIT
}

fn default_compact_bit() -> u8 {
    DEFAULT_COMPACT_BIT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StringObjectOffsets {
    pub length: u32,
    pub data: u32,
    // PyASCIIObject only
    pub state: Option<u32>,
    #[serde(default = "default_ascii_bit")]
    pub ascii_bit: u8,
    #[serde(default = "default_compact_bit")]
    pub compact_bit: u8,
}

impl Default for StringObjectOffsets {
    fn default() -> Self {
        Self {
            length: 0,
            data: 0,
            state: None,
            ascii_bit: DEFAULT_ASCII_BIT,
            compact_bit: DEFAULT_COMPACT_BIT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TssOffsets {
    pub is_initialized: Option<u32>,
    pub key: Option<u32>,
}

/// Field offsets of the runtime structures the unwinder dereferences.
///
/// One value describes every supported release; fields missing from a
/// release are `None` and the walkers branch on their presence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PythonInternalsOffsets {
    #[serde(default)]
    pub runtime_state: RuntimeStateOffsets,
    pub thread_state: ThreadStateOffsets,
    #[serde(default)]
    pub cframe: CframeOffsets,
    pub frame: FrameOffsets,
    pub interpreter_state: InterpreterStateOffsets,
    pub code_object: CodeObjectOffsets,
    pub string_object: StringObjectOffsets,
    #[serde(default)]
    pub tss: TssOffsets,
}

type JsonSection = HashMap<String, i64>;

struct Section<'a> {
    name: &'static str,
    fields: Option<&'a JsonSection>,
}

impl<'a> Section<'a> {
    fn new(name: &'static str, sections: &'a HashMap<String, JsonSection>) -> Self {
        Self {
            name,
            fields: sections.get(name),
        }
    }

    fn optional(&self, keys: &[&str]) -> Option<u32> {
        let fields = self.fields?;
        keys.iter()
            .find_map(|k| fields.get(*k))
            .and_then(|v| u32::try_from(*v).ok())
    }

    fn required(&self, keys: &[&'static str]) -> Result<u32> {
        self.optional(keys)
            .ok_or(Error::MissingOffset(self.name, keys[0]))
    }
}

impl PythonInternalsOffsets {
    /// Parse the offsets dumped per CPython release, e.g.
    /// `{"PyThreadState": {"next": 8, ...}, "PyCodeObject": {...}, ...}`.
    ///
    /// Negative values mean "not present" like missing keys do.
    pub fn from_offsets_json(content: &str) -> Result<Self> {
        let sections: HashMap<String, JsonSection> = serde_json::from_str(content)?;

        let thread_state = Section::new("PyThreadState", &sections);
        let interp = Section::new("PyInterpreterState", &sections);
        let code = Section::new("PyCodeObject", &sections);
        let runtime = Section::new("_PyRuntimeState", &sections);
        let cframe = Section::new("_PyCFrame", &sections);
        let ascii = Section::new("PyASCIIObject", &sections);
        let tss = Section::new("Py_tss_t", &sections);
        // 3.11 replaced frame objects with interpreter frames on the hot path
        let frame = if sections.contains_key("_PyInterpreterFrame") {
            Section::new("_PyInterpreterFrame", &sections)
        } else {
            Section::new("PyFrameObject", &sections)
        };

        let bit = |key: &str, default: u8| {
            ascii
                .optional(&[key])
                .and_then(|v| u8::try_from(v).ok())
                .unwrap_or(default)
        };

        Ok(Self {
            runtime_state: RuntimeStateOffsets {
                interpreters_main: runtime.optional(&["interpreters.main"]),
            },
            thread_state: ThreadStateOffsets {
                cframe: thread_state.optional(&["cframe"]),
                current_frame: thread_state.optional(&["current_frame", "frame"]),
                thread_id: thread_state.optional(&["thread_id"]),
                native_thread_id: thread_state.optional(&["native_thread_id"]),
                prev_thread: thread_state.required(&["prev"])?,
                next_thread: thread_state.required(&["next"])?,
            },
            cframe: CframeOffsets {
                current_frame: cframe.optional(&["current_frame"]),
            },
            frame: FrameOffsets {
                f_code: frame.required(&["f_code", "f_executable"])?,
                previous: frame.required(&["previous", "f_back"])?,
                owner: frame.optional(&["owner"]),
            },
            interpreter_state: InterpreterStateOffsets {
                threads_head: interp.required(&["threads.head", "tstate_head"])?,
            },
            code_object: CodeObjectOffsets {
                co_firstlineno: code.required(&["co_firstlineno"])?,
                filename: code.required(&["co_filename"])?,
                qualname: code.required(&["co_qualname", "co_name"])?,
            },
            string_object: StringObjectOffsets {
                length: ascii.required(&["length"])?,
                data: ascii.required(&["data"])?,
                state: ascii.optional(&["state"]),
                ascii_bit: bit("ascii_bit", DEFAULT_ASCII_BIT),
                compact_bit: bit("compact_bit", DEFAULT_COMPACT_BIT),
            },
            tss: TssOffsets {
                is_initialized: tss.optional(&["_is_initialized", "is_initialized"]),
                key: tss.optional(&["_key", "key"]),
            },
        })
    }
}

thread_local! {
    static OFFSETS_FILE_REGEX: OnceCell<Regex> = OnceCell::new();
    static VERSION_REGEX: OnceCell<Regex> = OnceCell::new();
}

/// Load a `cpython-X.Y.Z-offsets.json` file, taking the version from its name
/// when it follows that pattern.
pub fn load_offsets_file<P: AsRef<Path>>(
    path: P,
) -> Result<(Option<Version>, PythonInternalsOffsets)> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let offsets = PythonInternalsOffsets::from_offsets_json(&content)?;
    let version = path.file_name().and_then(|n| n.to_str()).and_then(|name| {
        OFFSETS_FILE_REGEX.with(|r| {
            let r = r.get_or_init(|| {
                Regex::new(r"^cpython-(\d+)\.(\d+)\.(\d+)-offsets\.json$").unwrap()
            });
            let cap = r.captures(name)?;
            Some(Version::new(
                cap[1].parse().ok()?,
                cap[2].parse().ok()?,
                cap[3].parse().ok()?,
            ))
        })
    });
    debug!("loaded python offsets from {} version {:?}", path.display(), version);
    Ok((version, offsets))
}

pub fn encode_version(version: &Version) -> u32 {
    (version.patch as u32) + ((version.minor as u32) << 8) + ((version.major as u32) << 16)
}

pub fn decode_version(encoded: u32) -> Version {
    Version::new(
        (encoded >> 16) as u64,
        ((encoded >> 8) & 0xff) as u64,
        (encoded & 0xff) as u64,
    )
}

pub fn is_version_supported(version: &Version) -> bool {
    encode_version(version) >= encode_version(&Version::new(2, 4, 0)) && version.major <= 3
}

/// Find a CPython version such as `3.10.1` or `2.7` in free form text.
pub fn scan_version(text: &str) -> Result<Version> {
    VERSION_REGEX.with(|r| {
        let r = r.get_or_init(|| Regex::new(r"\b([23])\.(\d{1,2})(?:\.(\d{1,2}))?\b").unwrap());
        let version = r.captures(text).and_then(|cap| {
            Some(Version::new(
                cap.get(1)?.as_str().parse().ok()?,
                cap.get(2)?.as_str().parse().ok()?,
                cap.get(3)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or_default(),
            ))
        });
        trace!("scanned python version {:?} from `{}`", version, text);
        version.ok_or_else(|| Error::NoVersion(text.to_owned()))
    })
}

/// Everything the unwinder needs to know about one interpreter binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PythonConfig {
    /// Distance below the thread control block of the thread-state pointer, 0 if unknown.
    pub thread_state_tls_offset: u64,
    pub runtime_relative_address: u64,
    pub interp_head_relative_address: u64,
    pub auto_tss_key_relative_address: u64,
    pub version: u32,
    /// 0 for PEP 393 compact strings, 1 for UCS2 and 2 for UCS4 builds.
    pub unicode_type_size_log2: u8,
    pub offsets: PythonInternalsOffsets,
}

impl PythonConfig {
    pub fn version(&self) -> Version {
        decode_version(self.version)
    }

    pub fn codepoint_size(&self) -> u8 {
        1 << self.unicode_type_size_log2
    }

    /// Reject configurations the walkers cannot use safely.
    pub fn validate(&self) -> Result<()> {
        let version = self.version();
        if !is_version_supported(&version) {
            return Err(Error::BadInterpreterVersion("python", version));
        }
        if self.unicode_type_size_log2 > 2 {
            return Err(Error::BadUnicodeWidth(self.unicode_type_size_log2));
        }
        let offsets = &self.offsets;
        if self.unicode_type_size_log2 == 0 && offsets.string_object.state.is_none() {
            return Err(Error::MissingOffset("PyASCIIObject", "state"));
        }
        match offsets.thread_state.cframe {
            Some(_) if offsets.cframe.current_frame.is_none() => {
                return Err(Error::MissingOffset("_PyCFrame", "current_frame"));
            }
            None if offsets.thread_state.current_frame.is_none() => {
                return Err(Error::MissingOffset("PyThreadState", "current_frame"));
            }
            _ => (),
        }
        if offsets.thread_state.native_thread_id.is_none() && offsets.thread_state.thread_id.is_none()
        {
            debug!("python v{version} has no thread id offset, thread state cache disabled");
        }
        Ok(())
    }
}

/// Per-sample scratch space, reset before every walk.
pub struct UnwindState {
    pub pid: u32,
    pub frames: [SymbolKey; PYTHON_MAX_STACK_DEPTH],
    pub frame_count: usize,
    pub symbol_buffer: [u8; PYTHON_SYMBOL_BUFFER_SIZE],
}

impl Default for UnwindState {
    fn default() -> Self {
        Self {
            pid: 0,
            frames: [SymbolKey::default(); PYTHON_MAX_STACK_DEPTH],
            frame_count: 0,
            symbol_buffer: [0; PYTHON_SYMBOL_BUFFER_SIZE],
        }
    }
}

impl UnwindState {
    pub fn reset(&mut self, pid: u32) {
        self.pid = pid;
        self.frame_count = 0;
    }

    /// Append a frame, returns false when the frame array is full.
    pub fn push(&mut self, key: SymbolKey) -> bool {
        if self.frame_count >= PYTHON_MAX_STACK_DEPTH {
            return false;
        }
        self.frames[self.frame_count] = key;
        self.frame_count += 1;
        true
    }

    /// Frames collected so far, innermost first.
    pub fn frames(&self) -> &[SymbolKey] {
        &self.frames[..self.frame_count]
    }
}
