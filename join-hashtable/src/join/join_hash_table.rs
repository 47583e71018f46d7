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

use super::cache::HashTableCache;
use super::device_build::{DeviceBuilder, DeviceHashTable};
use super::hash_layout::{HashType, ShardLayout};
use super::linearize::ColumnLinearizer;
use crate::error::{ErrorKind, Result};
use crate::expr::{normalize_column_pair, BinOper, JoinKey};
use crate::range::{IntRange, ValueRangeProvider};
use crate::storage::{
    get_inner_query_info, get_shard_count, ColumnFetcher, InputTableInfo, TablePartitioning,
};
use device_mem::runtime::memory::{DeviceId, DeviceMemoryProvider, MemoryLevel};
use log::{debug, info};
use std::collections::HashSet;
use std::mem::size_of;
use std::sync::Arc;

/// Tuning knobs of hash table construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HashTableConfig {
    /// Maximum number of fragments linearized for one device
    pub max_linearized_fragments: usize,
    /// Build the tables of multiple devices in parallel
    pub parallel_device_build: bool,
    /// Skip the one-to-one attempt, e.g. because the query needs all matches
    pub force_one_to_many: bool,
}

impl Default for HashTableConfig {
    fn default() -> Self {
        Self {
            max_linearized_fragments: 4096,
            parallel_device_build: true,
            force_one_to_many: false,
        }
    }
}

/// A hash table for an equi-join, built on the inner column for each device.
///
/// The table is fully built on construction. All devices use the same
/// layout. Device memory is released when the table is dropped.
#[derive(Debug)]
pub struct JoinHashTable {
    join_key: JoinKey,
    col_range: IntRange,
    memory_level: MemoryLevel,
    hash_type: HashType,
    shard_count: usize,
    device_count: u32,
    tables: Vec<DeviceHashTable>,
}

/// Everything generated code needs to know to probe a hash table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HashJoinContract {
    pub hash_type: HashType,
    pub memory_level: MemoryLevel,
    pub device_id: DeviceId,
    /// Address of the table, in host memory or in device memory
    pub buffer: u64,
    pub entry_count: usize,
    /// Keys are shifted by `min_key` to compute the bucket
    pub min_key: i64,
    pub max_key: i64,
    pub null_sentinel: i64,
    /// Key of the `NULL` bucket, only for bitwise equality
    pub translated_null: Option<i64>,
    pub has_nulls: bool,
    pub shard: Option<ShardLayout>,
    /// Size in bytes of the offsets section, and of the counts section
    pub sub_buff_size: usize,
}

impl HashJoinContract {
    /// Returns true if rows with a `NULL` key never match.
    pub fn skips_null_keys(&self) -> bool {
        self.translated_null.is_none()
    }

    pub fn offsets_address(&self) -> Option<u64> {
        self.one_to_many_section(0)
    }

    pub fn counts_address(&self) -> Option<u64> {
        self.one_to_many_section(1)
    }

    pub fn payload_address(&self) -> Option<u64> {
        self.one_to_many_section(2)
    }

    fn one_to_many_section(&self, section: u64) -> Option<u64> {
        match self.hash_type {
            HashType::OneToOne => None,
            HashType::OneToMany => Some(self.buffer + section * self.sub_buff_size as u64),
        }
    }
}

impl JoinHashTable {
    /// Address of the table of `device_id` at `memory_level`, or 0 if there
    /// is none.
    pub fn join_hash_buffer(&self, memory_level: MemoryLevel, device_id: DeviceId) -> u64 {
        if memory_level != self.memory_level && memory_level.is_gpu() {
            return 0;
        }
        self.table(device_id)
            .map_or(0, |table| table.buffer_address(memory_level))
    }

    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    pub fn join_key(&self) -> &JoinKey {
        &self.join_key
    }

    pub fn inner_table_id(&self) -> i32 {
        self.join_key.inner.table_id
    }

    pub fn inner_rte_idx(&self) -> usize {
        self.join_key.inner.rte_idx
    }

    pub fn col_range(&self) -> &IntRange {
        &self.col_range
    }

    pub fn memory_level(&self) -> MemoryLevel {
        self.memory_level
    }

    /// Number of buckets in the table of each device.
    pub fn entry_count(&self) -> usize {
        self.tables.first().map_or(0, |t| t.host_buffer().entry_count())
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn device_count(&self) -> u32 {
        self.device_count
    }

    pub fn table(&self, device_id: DeviceId) -> Option<&DeviceHashTable> {
        self.tables.get(device_id as usize)
    }

    /// Looks up the inner rows matching `key` in the table of `device_id`.
    pub fn probe(&self, device_id: DeviceId, key: i64) -> &[i32] {
        self.table(device_id).map_or(&[], |table| table.probe(key))
    }

    pub fn codegen_contract(&self, device_id: DeviceId) -> Result<HashJoinContract> {
        let table = self.table(device_id).ok_or_else(|| {
            ErrorKind::InvalidArgument(format!(
                "Hash table has no device {}, only {}",
                device_id, self.device_count
            ))
        })?;
        let mapping = table.key_mapping();

        Ok(HashJoinContract {
            hash_type: self.hash_type,
            memory_level: self.memory_level,
            device_id,
            buffer: table.buffer_address(self.memory_level),
            entry_count: mapping.entry_count,
            min_key: mapping.min,
            max_key: mapping.max,
            null_sentinel: mapping.null_sentinel,
            translated_null: mapping.translated_null,
            has_nulls: self.col_range.has_nulls,
            shard: mapping.shard,
            sub_buff_size: mapping.entry_count * size_of::<i32>(),
        })
    }
}

/// Configures and builds a `JoinHashTable`.
pub struct JoinHashTableBuilder {
    qual_bin_oper_i: Option<BinOper>,
    query_infos: Vec<InputTableInfo>,
    memory_level: MemoryLevel,
    device_count: u32,
    skip_tables: HashSet<i32>,
    column_fetcher_i: Option<Arc<dyn ColumnFetcher>>,
    range_provider_i: Option<Arc<dyn ValueRangeProvider>>,
    device_memory_i: Option<Arc<dyn DeviceMemoryProvider>>,
    cache_i: Option<Arc<HashTableCache>>,
    config: HashTableConfig,
}

impl Default for JoinHashTableBuilder {
    fn default() -> Self {
        Self {
            qual_bin_oper_i: None,
            query_infos: Vec::new(),
            memory_level: MemoryLevel::Cpu,
            device_count: 1,
            skip_tables: HashSet::new(),
            column_fetcher_i: None,
            range_provider_i: None,
            device_memory_i: None,
            cache_i: None,
            config: HashTableConfig::default(),
        }
    }
}

impl JoinHashTableBuilder {
    /// The equality condition to build the hash table for.
    pub fn qual_bin_oper(mut self, qual_bin_oper: BinOper) -> Self {
        self.qual_bin_oper_i = Some(qual_bin_oper);
        self
    }

    pub fn query_infos(mut self, query_infos: Vec<InputTableInfo>) -> Self {
        self.query_infos = query_infos;
        self
    }

    pub fn memory_level(mut self, memory_level: MemoryLevel) -> Self {
        self.memory_level = memory_level;
        self
    }

    /// Number of devices at the GPU memory level. At the CPU memory level,
    /// one table is built.
    pub fn device_count(mut self, device_count: u32) -> Self {
        self.device_count = device_count;
        self
    }

    /// Tables that must not be used as the inner table.
    pub fn skip_tables(mut self, skip_tables: HashSet<i32>) -> Self {
        self.skip_tables = skip_tables;
        self
    }

    pub fn column_fetcher(mut self, column_fetcher: Arc<dyn ColumnFetcher>) -> Self {
        self.column_fetcher_i = Some(column_fetcher);
        self
    }

    pub fn range_provider(mut self, range_provider: Arc<dyn ValueRangeProvider>) -> Self {
        self.range_provider_i = Some(range_provider);
        self
    }

    pub fn device_memory(mut self, device_memory: Arc<dyn DeviceMemoryProvider>) -> Self {
        self.device_memory_i = Some(device_memory);
        self
    }

    pub fn cache(mut self, cache: Arc<HashTableCache>) -> Self {
        self.cache_i = Some(cache);
        self
    }

    pub fn config(mut self, config: HashTableConfig) -> Self {
        self.config = config;
        self
    }

    /// Checks that a hash join is feasible, and builds the tables of all
    /// devices.
    ///
    /// If the one-to-one layout collides on any device, the tables of all
    /// devices are rebuilt with the one-to-many layout.
    pub fn build(&self) -> Result<JoinHashTable> {
        let qual = self.qual_bin_oper_i.as_ref().ok_or_else(|| {
            ErrorKind::InvalidArgument("Join condition not set".to_string())
        })?;
        let fetcher = self.column_fetcher_i.as_ref().ok_or_else(|| {
            ErrorKind::InvalidArgument("Column fetcher not set".to_string())
        })?;
        let range_provider = self.range_provider_i.as_ref().ok_or_else(|| {
            ErrorKind::InvalidArgument("Range provider not set".to_string())
        })?;

        let join_key = normalize_column_pair(qual)?;
        let inner = &join_key.inner;
        if self.skip_tables.contains(&inner.table_id) {
            Err(ErrorKind::UnsupportedJoin(format!(
                "Inner table {} is excluded",
                inner.table_id
            )))?;
        }
        if inner.is_virtual {
            Err(ErrorKind::VirtualColumnJoin(inner.name.clone()))?;
        }

        let col_range = *range_provider
            .column_range(inner, &self.query_infos, &self.skip_tables)
            .as_integer()
            .ok_or_else(|| {
                ErrorKind::ColumnRangeInvalid(format!(
                    "Could not compute an integer range for {}",
                    inner.name
                ))
            })?;
        // Checks the bucket count and the NULL translation
        col_range.bucket_count(join_key.op.is_bw_eq())?;
        if join_key.op.is_bw_eq() {
            col_range.translated_null()?;
        }

        let query_info = get_inner_query_info(inner.table_id, &self.query_infos)?;
        let device_count = self.check_device_count()?;
        let shard_count = if self.memory_level.is_gpu() && !join_key.op.is_bw_eq() {
            get_shard_count(&join_key, &self.query_infos)
        } else {
            0
        };
        check_replication_constraint(query_info, self.memory_level, device_count, shard_count)?;

        debug!(
            "Building hash table for {} with range [{}, {}] on {} {} device(s), {} shards",
            qual, col_range.min, col_range.max, device_count, self.memory_level, shard_count
        );

        let linearizer = ColumnLinearizer::new(self.config.max_linearized_fragments);
        let builder = DeviceBuilder {
            join_key: &join_key,
            col_range,
            query_info,
            memory_level: self.memory_level,
            device_count,
            shard_count,
            fetcher: &**fetcher,
            linearizer: &linearizer,
            device_memory: self.device_memory_i.as_ref(),
            cache: self.cache_i.as_deref(),
            parallel: self.config.parallel_device_build,
        };

        let initial = if self.config.force_one_to_many {
            HashType::OneToMany
        } else {
            HashType::OneToOne
        };
        let (hash_type, tables) = match builder.build_all(initial)? {
            Some(tables) => (initial, tables),
            None => {
                info!(
                    "Keys of {} are not unique, rebuilding the hash table as one-to-many",
                    inner.name
                );
                let tables = builder.build_all(HashType::OneToMany)?.ok_or_else(|| {
                    ErrorKind::LogicError("One-to-many hash table reported a collision".to_string())
                })?;
                (HashType::OneToMany, tables)
            }
        };

        Ok(JoinHashTable {
            join_key,
            col_range,
            memory_level: self.memory_level,
            hash_type,
            shard_count,
            device_count,
            tables,
        })
    }

    fn check_device_count(&self) -> Result<u32> {
        match self.memory_level {
            MemoryLevel::Cpu => Ok(1),
            MemoryLevel::Gpu => {
                let provider = self.device_memory_i.as_ref().ok_or_else(|| {
                    ErrorKind::InvalidArgument("Device memory provider not set".to_string())
                })?;
                if self.device_count == 0 || self.device_count > provider.device_count() {
                    Err(ErrorKind::InvalidArgument(format!(
                        "Cannot build on {} devices, {} are available",
                        self.device_count,
                        provider.device_count()
                    )))?;
                }
                Ok(self.device_count)
            }
        }
    }
}

/// Checks that every device can see the inner rows it has to join.
///
/// Shards must be distributed evenly over the devices. Without sharding,
/// every device needs all rows, so the inner table must not be partitioned.
fn check_replication_constraint(
    query_info: &InputTableInfo,
    memory_level: MemoryLevel,
    device_count: u32,
    shard_count: usize,
) -> Result<()> {
    if !memory_level.is_gpu() || device_count <= 1 {
        return Ok(());
    }

    if shard_count > 0 {
        if shard_count % device_count as usize != 0 {
            Err(ErrorKind::ReplicationConstraint(format!(
                "{} shards cannot be distributed evenly over {} devices",
                shard_count, device_count
            )))?;
        }
    } else if query_info.partitioning == TablePartitioning::Partitioned {
        Err(ErrorKind::ReplicationConstraint(format!(
            "Inner table {} must be replicated",
            query_info.table_id
        )))?;
    }

    Ok(())
}
