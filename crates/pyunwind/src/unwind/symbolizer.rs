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
use std::sync::Arc;

use log::debug;

use crate::stats::{Counter, CounterType, CounterValue, RefCountable};

use super::cache::LruMap;
use super::symbol::{Symbol, SymbolCache, SymbolKey};

pub const DEFAULT_SYMBOLIZER_CACHE_SIZE: usize = 1 << 13;

pub type DecodedSymbolCache = LruMap<SymbolKey, Arc<DecodedSymbol>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSymbol {
    pub name: String,
    pub file_name: String,
}

#[derive(Debug, Default)]
struct SymbolizerCounter {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failed_decode_utf: AtomicU64,
}

/// Turns symbol keys collected by the unwinder into strings.
///
/// Raw symbols are taken from the shared symbol cache and decoded once, the
/// decoded strings live in a cache of their own, which may be shared with
/// other symbolizers of the same unwinder.
pub struct Symbolizer {
    symbols: Arc<SymbolCache>,
    cache: Arc<DecodedSymbolCache>,
    counter: SymbolizerCounter,
}

pub fn new_decoded_cache(cache_size: usize) -> DecodedSymbolCache {
    if cache_size == 0 {
        LruMap::new(DEFAULT_SYMBOLIZER_CACHE_SIZE)
    } else {
        LruMap::new(cache_size)
    }
}

fn until_nul<const N: usize>(data: &[u8]) -> &[u8] {
    let end = data
        .chunks_exact(N)
        .position(|c| c.iter().all(|b| *b == 0))
        .map(|i| i * N)
        .unwrap_or(data.len() - data.len() % N);
    &data[..end]
}

impl Symbolizer {
    pub fn new(symbols: Arc<SymbolCache>, cache_size: usize) -> Self {
        Self::with_cache(symbols, Arc::new(new_decoded_cache(cache_size)))
    }

    pub fn with_cache(symbols: Arc<SymbolCache>, cache: Arc<DecodedSymbolCache>) -> Self {
        Self {
            symbols,
            cache,
            counter: SymbolizerCounter::default(),
        }
    }

    /// Drop decoded symbols of an exited process.
    pub fn unload(&self, pid: u32) {
        self.cache.retain(|key| key.pid != pid);
    }

    pub fn symbolize(&self, key: &SymbolKey) -> Option<Arc<DecodedSymbol>> {
        if let Some(symbol) = self.cache.get(key) {
            self.counter.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Some(symbol);
        }
        self.counter.cache_misses.fetch_add(1, Ordering::Relaxed);

        let raw = self.symbols.get(key)?;
        let decoded = Arc::new(self.decode(&raw)?);
        self.cache.insert(*key, decoded.clone());
        Some(decoded)
    }

    pub fn decode(&self, symbol: &Symbol) -> Option<DecodedSymbol> {
        let (name, filename) = (symbol.name_bytes(), symbol.filename_bytes());
        let (name, file_name) = match symbol.codepoint_size {
            1 => (
                String::from_utf8_lossy(until_nul::<1>(name)).into_owned(),
                String::from_utf8_lossy(until_nul::<1>(filename)).into_owned(),
            ),
            2 => (self.decode_utf16(name), self.decode_utf16(filename)),
            4 => (self.decode_utf32(name), self.decode_utf32(filename)),
            n => {
                debug!("unexpected python codepoint size {n}");
                return None;
            }
        };
        Some(DecodedSymbol { name, file_name })
    }

    fn decode_utf16(&self, data: &[u8]) -> String {
        let units = until_nul::<2>(data)
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]));
        match char::decode_utf16(units).collect::<Result<String, _>>() {
            Ok(s) => s,
            Err(_) => {
                self.counter.failed_decode_utf.fetch_add(1, Ordering::Relaxed);
                String::new()
            }
        }
    }

    fn decode_utf32(&self, data: &[u8]) -> String {
        let decoded: Option<String> = until_nul::<4>(data)
            .chunks_exact(4)
            .map(|c| char::from_u32(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        decoded.unwrap_or_else(|| {
            self.counter.failed_decode_utf.fetch_add(1, Ordering::Relaxed);
            String::new()
        })
    }
}

impl RefCountable for Symbolizer {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "cache-hits",
                CounterType::Counted,
                CounterValue::Unsigned(self.counter.cache_hits.swap(0, Ordering::Relaxed)),
            ),
            (
                "cache-misses",
                CounterType::Counted,
                CounterValue::Unsigned(self.counter.cache_misses.swap(0, Ordering::Relaxed)),
            ),
            (
                "failed-decode-utf",
                CounterType::Counted,
                CounterValue::Unsigned(self.counter.failed_decode_utf.swap(0, Ordering::Relaxed)),
            ),
            (
                "cache-size",
                CounterType::Gauged,
                CounterValue::Unsigned(self.cache.len() as u64),
            ),
            (
                "cache-capacity",
                CounterType::Gauged,
                CounterValue::Unsigned(self.cache.capacity() as u64),
            ),
        ]
    }
}
