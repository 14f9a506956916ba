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

use semver::Version;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    FileReadError(#[from] std::io::Error),
    #[error(transparent)]
    JsonParseError(#[from] serde_json::Error),
    #[error("{0} v{1} not supported")]
    BadInterpreterVersion(&'static str, Version),
    #[error("unicode type size log2 {0} out of range")]
    BadUnicodeWidth(u8),
    #[error("offset `{1}` missing in {0} offsets")]
    MissingOffset(&'static str, &'static str),
    #[error("no python offsets configured")]
    NoOffsets,
    #[error("cannot find version in `{0}`")]
    NoVersion(String),
}

pub type Result<T> = std::result::Result<T, Error>;
