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

use std::sync::Arc;

use ahash::AHashMap;
use log::debug;
use parking_lot::RwLock;

use super::process::BinaryId;

/// Per binary configuration published by the binary analysis side.
///
/// Lookups never fail loudly: a binary without configuration is a normal
/// input and the caller simply skips the sample.
pub struct ConfigStorage<T> {
    name: &'static str,
    configs: RwLock<AHashMap<BinaryId, Arc<T>>>,
}

impl<T> ConfigStorage<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            configs: RwLock::new(AHashMap::new()),
        }
    }

    /// Returns the previous configuration of `id` if any.
    pub fn add(&self, id: BinaryId, config: T) -> Option<Arc<T>> {
        debug!("{} config added for binary {:#x}", self.name, id);
        self.configs.write().insert(id, Arc::new(config))
    }

    pub fn release(&self, id: BinaryId) -> Option<Arc<T>> {
        let removed = self.configs.write().remove(&id);
        if removed.is_some() {
            debug!("{} config released for binary {:#x}", self.name, id);
        }
        removed
    }

    pub fn get(&self, id: BinaryId) -> Option<Arc<T>> {
        self.configs.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.configs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
