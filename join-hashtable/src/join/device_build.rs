// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-device hash table construction.
//!
//! Every device receives its own hash table. Without sharding, all devices
//! hold a replica of the same table. With sharding, each device builds a
//! table over the fragments of the shards it owns.

use super::cache::{HashTableCache, HashTableCacheKey};
use super::cpu_build::{fill_hash_table, FillOutcome};
use super::hash_layout::{HashTableBuffer, HashType, KeyMapping};
use super::linearize::ColumnLinearizer;
use crate::error::{ErrorKind, Result};
use crate::expr::JoinKey;
use crate::range::IntRange;
use crate::storage::{only_shards_for_device, ChunkKey, ColumnFetcher, FragmentInfo, InputTableInfo};
use device_mem::runtime::memory::{DeviceBuffer, DeviceId, DeviceMemoryProvider, MemoryLevel};
use log::debug;
use rayon::prelude::*;
use std::borrow::Cow;
use std::sync::Arc;

/// The hash table of one device.
///
/// At the GPU memory level, the table is also copied into device memory.
/// The device copy is freed when the table is dropped.
#[derive(Debug)]
pub struct DeviceHashTable {
    device_id: DeviceId,
    host: Arc<HashTableBuffer>,
    device: Option<DeviceBuffer<i32>>,
}

impl DeviceHashTable {
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn host_buffer(&self) -> &Arc<HashTableBuffer> {
        &self.host
    }

    pub fn device_buffer(&self) -> Option<&DeviceBuffer<i32>> {
        self.device.as_ref()
    }

    pub fn key_mapping(&self) -> &KeyMapping {
        self.host.key_mapping()
    }

    pub fn probe(&self, key: i64) -> &[i32] {
        self.host.probe(key)
    }

    /// Address of the table at `memory_level`, or 0 if there is none.
    pub fn buffer_address(&self, memory_level: MemoryLevel) -> u64 {
        match memory_level {
            MemoryLevel::Cpu => {
                let slice = self.host.layout().as_slice();
                if slice.is_empty() {
                    0
                } else {
                    slice.as_ptr() as u64
                }
            }
            MemoryLevel::Gpu => self
                .device
                .as_ref()
                .map_or(0, |buffer| buffer.as_device_ptr().as_raw()),
        }
    }
}

/// Everything that the devices of one hash table share while building.
pub(crate) struct DeviceBuilder<'a> {
    pub join_key: &'a JoinKey,
    pub col_range: IntRange,
    pub query_info: &'a InputTableInfo,
    pub memory_level: MemoryLevel,
    pub device_count: u32,
    pub shard_count: usize,
    pub fetcher: &'a dyn ColumnFetcher,
    pub linearizer: &'a ColumnLinearizer,
    pub device_memory: Option<&'a Arc<dyn DeviceMemoryProvider>>,
    pub cache: Option<&'a HashTableCache>,
    pub parallel: bool,
}

impl<'a> DeviceBuilder<'a> {
    /// Builds the tables of all devices with layout `hash_type`.
    ///
    /// Returns `None` if any device collides. The tables of the other
    /// devices are then dropped, so that all devices of a hash table use the
    /// same layout. On error, all device memory acquired so far is freed.
    pub fn build_all(&self, hash_type: HashType) -> Result<Option<Vec<DeviceHashTable>>> {
        let outcomes = if self.parallel {
            (0..self.device_count)
                .into_par_iter()
                .map(|device_id| self.build_for_device(hash_type, device_id))
                .collect::<Result<Vec<_>>>()?
        } else {
            (0..self.device_count)
                .map(|device_id| self.build_for_device(hash_type, device_id))
                .collect::<Result<Vec<_>>>()?
        };
        if outcomes.iter().any(FillOutcome::is_collision) {
            return Ok(None);
        }

        let tables = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                FillOutcome::Complete(table) => Some(table),
                FillOutcome::Collision { .. } => None,
            })
            .collect();
        Ok(Some(tables))
    }

    fn fragments_for_device(&self, device_id: DeviceId) -> Result<Cow<'a, [FragmentInfo]>> {
        if self.shard_count > 0 {
            only_shards_for_device(&self.query_info.fragments, device_id, self.device_count)
                .map(Cow::Owned)
        } else {
            Ok(Cow::Borrowed(&self.query_info.fragments))
        }
    }

    fn key_mapping_for_device(&self, device_id: DeviceId) -> Result<KeyMapping> {
        let inner = &self.join_key.inner;
        let null_sentinel = inner.sql_type.null_sentinel().ok_or_else(|| {
            ErrorKind::UnsupportedJoin(format!("Type {} has no integer keys", inner.sql_type))
        })?;
        let mapping = KeyMapping::new(&self.col_range, null_sentinel, self.join_key.op.is_bw_eq())?;

        if self.shard_count > 0 {
            mapping.sharded(
                self.shard_count,
                self.device_count as usize,
                device_id as usize,
            )
        } else {
            Ok(mapping)
        }
    }

    fn build_for_device(
        &self,
        hash_type: HashType,
        device_id: DeviceId,
    ) -> Result<FillOutcome<DeviceHashTable>> {
        let inner = &self.join_key.inner;
        let fragments = self.fragments_for_device(device_id)?;
        let mapping = self.key_mapping_for_device(device_id)?;

        // Temporary tables can be reused under the same id
        let cache_key = self.cache.filter(|_| inner.table_id >= 0).map(|cache| {
            let key = HashTableCacheKey {
                col_range: self.col_range,
                inner_col: inner.clone(),
                outer_col: self.join_key.outer.clone(),
                num_elements: fragments.iter().map(|f| f.num_tuples).sum(),
                chunk_key: ChunkKey::for_fragments(inner, &fragments),
                optype: self.join_key.op,
                hash_type,
                shard: mapping.shard,
            };
            (cache, key)
        });

        if let Some((cache, key)) = cache_key.as_ref() {
            if let Some(bucket) = cache.get_collision(key) {
                debug!(
                    "{} table of device {} is known to collide at bucket {}",
                    hash_type, device_id, bucket
                );
                return Ok(FillOutcome::Collision { bucket });
            }
        }

        let cached = cache_key.as_ref().and_then(|(cache, key)| cache.get(key));
        let host = match cached {
            Some(buffer) => buffer,
            None => {
                let column = self.linearizer.fetch_column(self.fetcher, inner, &fragments)?;
                let layout = match fill_hash_table(hash_type, &column, &mapping)? {
                    FillOutcome::Complete(layout) => layout,
                    FillOutcome::Collision { bucket } => {
                        debug!(
                            "{} table collides at bucket {} on device {}",
                            hash_type, bucket, device_id
                        );
                        if let Some((cache, key)) = cache_key {
                            cache.insert_collision(key, bucket);
                        }
                        return Ok(FillOutcome::Collision { bucket });
                    }
                };
                debug!(
                    "Built {} table with {} buckets over {} rows for device {}",
                    hash_type,
                    layout.entry_count(),
                    column.len(),
                    device_id
                );

                let buffer = Arc::new(HashTableBuffer::new(mapping, layout)?);
                match cache_key {
                    Some((cache, key)) => cache.insert(key, buffer),
                    None => buffer,
                }
            }
        };

        let device = if self.memory_level.is_gpu() {
            let provider = self.device_memory.ok_or_else(|| {
                ErrorKind::InvalidArgument("GPU hash tables require device memory".to_string())
            })?;
            Some(DeviceBuffer::from_slice(
                provider,
                host.layout().as_slice(),
                device_id,
            )?)
        } else {
            None
        };

        Ok(FillOutcome::Complete(DeviceHashTable {
            device_id,
            host,
            device,
        }))
    }
}
