/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2019, Clemens Lutz <lutzcle@cml.li>
 * Author: Clemens Lutz <clemens.lutz@dfki.de>
 */

use crate::error::{ErrorKind, Result};
use crate::types::*;
use datagen::relation::{KeyAttribute, UniformRelation, ZipfRelation};
use device_mem::runtime::allocator::HostBackedDeviceMemory;
use device_mem::runtime::memory::MemoryLevel;
use join_hashtable::expr::{BinOper, ColumnVar, Expr, JoinOp, SqlType};
use join_hashtable::join::{
    CacheConfig, HashTableCache, HashTableConfig, JoinHashTable, JoinHashTableBuilder,
};
use join_hashtable::storage::{ColumnBuffer, TablePartitioning, TableStore};
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const OUTER_TABLE: i32 = 1;
const INNER_TABLE: i32 = 2;
const KEY_COLUMN: i32 = 0;

/// Number of keys looked up after each build to verify the hash table.
const PROBE_SAMPLES: usize = 1024;

pub struct HashTableBench {
    pub inner_len: usize,
    pub device_count: u32,
    table_builder: JoinHashTableBuilder,
    cache: Option<Arc<HashTableCache>>,
    probe_keys: Vec<i64>,
    key_counts: HashMap<i64, usize>,
    op: JoinOp,
}

pub struct HashTableBenchBuilder {
    inner_len: usize,
    fragment_len: usize,
    key_distribution: ArgKeyDistribution,
    zipf_exponent: f64,
    null_percent: u32,
    shard_count: usize,
    memory_level: MemoryLevel,
    device_count: u32,
    device_memory_bytes: usize,
    cache_entries: usize,
    op: JoinOp,
    force_one_to_many: bool,
}

#[derive(Debug, Default)]
pub struct HashTablePoint {
    pub build_ns: Option<f64>,
    pub hash_type: Option<String>,
    pub entry_count: Option<usize>,
    pub shard_count: Option<usize>,
    pub hash_table_bytes: Option<usize>,
    pub cache_hits: Option<u64>,
    pub cache_misses: Option<u64>,
    pub verified_probes: Option<usize>,
}

impl Default for HashTableBenchBuilder {
    fn default() -> HashTableBenchBuilder {
        HashTableBenchBuilder {
            inner_len: 1,
            fragment_len: 1 << 20,
            key_distribution: ArgKeyDistribution::Unique,
            zipf_exponent: 1.0,
            null_percent: 0,
            shard_count: 0,
            memory_level: MemoryLevel::Cpu,
            device_count: 1,
            device_memory_bytes: 1 << 30,
            cache_entries: 0,
            op: JoinOp::Eq,
            force_one_to_many: false,
        }
    }
}

impl HashTableBenchBuilder {
    pub fn inner_len(&mut self, inner_len: usize) -> &mut Self {
        self.inner_len = inner_len;
        self
    }

    pub fn fragment_len(&mut self, fragment_len: usize) -> &mut Self {
        self.fragment_len = fragment_len;
        self
    }

    pub fn key_distribution(&mut self, key_distribution: ArgKeyDistribution) -> &mut Self {
        self.key_distribution = key_distribution;
        self
    }

    pub fn zipf_exponent(&mut self, zipf_exponent: f64) -> &mut Self {
        self.zipf_exponent = zipf_exponent;
        self
    }

    pub fn null_percent(&mut self, null_percent: u32) -> &mut Self {
        self.null_percent = null_percent;
        self
    }

    /// Shards the inner relation on the join key; 0 disables sharding.
    pub fn shard_count(&mut self, shard_count: usize) -> &mut Self {
        self.shard_count = shard_count;
        self
    }

    pub fn memory_level(&mut self, memory_level: MemoryLevel) -> &mut Self {
        self.memory_level = memory_level;
        self
    }

    pub fn device_count(&mut self, device_count: u32) -> &mut Self {
        self.device_count = device_count;
        self
    }

    pub fn device_memory_bytes(&mut self, device_memory_bytes: usize) -> &mut Self {
        self.device_memory_bytes = device_memory_bytes;
        self
    }

    /// Reuses hash tables across runs; 0 disables the cache.
    pub fn cache_entries(&mut self, cache_entries: usize) -> &mut Self {
        self.cache_entries = cache_entries;
        self
    }

    pub fn op(&mut self, op: JoinOp) -> &mut Self {
        self.op = op;
        self
    }

    pub fn force_one_to_many(&mut self, force_one_to_many: bool) -> &mut Self {
        self.force_one_to_many = force_one_to_many;
        self
    }

    /// Generates the inner relation and loads it into a table store.
    ///
    /// Returns the benchmark and the time taken to generate the data.
    pub fn build_with_data_gen(&self) -> Result<(HashTableBench, Duration)> {
        if self.null_percent > 100 {
            Err(ErrorKind::InvalidArgument(
                "Null percentage must be between 0 and 100".to_string(),
            ))?;
        }

        let data_gen_timer = Instant::now();
        let mut keys = vec![0_i32; self.inner_len];
        match self.key_distribution {
            ArgKeyDistribution::Unique => UniformRelation::gen_primary_key_par(&mut keys, 1)?,
            ArgKeyDistribution::Uniform => {
                UniformRelation::gen_attr(&mut keys, 1..=self.inner_len.max(1) as i64)?
            }
            ArgKeyDistribution::Zipf => ZipfRelation::gen_attr(
                &mut keys,
                1,
                self.inner_len.max(1),
                self.zipf_exponent,
            )?,
        }
        UniformRelation::inject_nulls(&mut keys, self.null_percent);
        let data_gen_time = data_gen_timer.elapsed();

        let mut key_counts = HashMap::new();
        keys.iter()
            .for_each(|&k| *key_counts.entry(k as i64).or_insert(0) += 1);

        let mut rng = thread_rng();
        let mut probe_keys: Vec<i64> = keys
            .choose_multiple(&mut rng, PROBE_SAMPLES)
            .map(|&k| k as i64)
            .collect();
        // Keys just outside of the generated domain must miss
        probe_keys.extend_from_slice(&[0, self.inner_len as i64 + 1, i32::null_key() as i64]);

        let partitioning = if self.shard_count > 0 {
            TablePartitioning::Sharded {
                column_id: KEY_COLUMN,
                shard_count: self.shard_count,
            }
        } else {
            TablePartitioning::Replicated
        };
        let store = Arc::new(TableStore::new());
        store.create_table(OUTER_TABLE, partitioning)?;
        store.create_table(INNER_TABLE, partitioning)?;
        store.load_columns(
            INNER_TABLE,
            vec![(KEY_COLUMN, ColumnBuffer::from(keys))],
            self.fragment_len,
        )?;
        let query_infos = vec![
            store.table_info(OUTER_TABLE)?,
            store.table_info(INNER_TABLE)?,
        ];
        debug!(
            "Loaded {} inner tuples in {} fragments",
            self.inner_len,
            query_infos[1].fragments.len()
        );

        let qual = BinOper::new(
            self.op,
            Expr::Column(
                ColumnVar::new(OUTER_TABLE, KEY_COLUMN, 0, SqlType::Int).with_name("outer.key"),
            ),
            Expr::Column(
                ColumnVar::new(INNER_TABLE, KEY_COLUMN, 1, SqlType::Int).with_name("inner.key"),
            ),
        );

        let cache = if self.cache_entries > 0 {
            Some(Arc::new(HashTableCache::new(CacheConfig {
                max_entries: self.cache_entries,
                ..CacheConfig::default()
            })))
        } else {
            None
        };

        let device_memory = Arc::new(HostBackedDeviceMemory::new(
            self.device_count,
            self.device_memory_bytes,
        ));
        let mut table_builder = JoinHashTableBuilder::default()
            .qual_bin_oper(qual)
            .query_infos(query_infos)
            .memory_level(self.memory_level)
            .device_count(self.device_count)
            .column_fetcher(store.clone())
            .range_provider(store)
            .device_memory(device_memory)
            .config(HashTableConfig {
                force_one_to_many: self.force_one_to_many,
                ..HashTableConfig::default()
            });
        if let Some(ref cache) = cache {
            table_builder = table_builder.cache(cache.clone());
        }

        let bench = HashTableBench {
            inner_len: self.inner_len,
            device_count: self.device_count,
            table_builder,
            cache,
            probe_keys,
            key_counts,
            op: self.op,
        };

        Ok((bench, data_gen_time))
    }
}

impl HashTableBench {
    /// Builds the hash table once and verifies it.
    pub fn run(&self) -> Result<HashTablePoint> {
        let stats_before = self.cache.as_ref().map(|c| c.stats());

        let timer = Instant::now();
        let table = self.table_builder.build()?;
        let build_time = timer.elapsed();

        let verified_probes = self.verify(&table)?;

        let hash_table_bytes: usize = (0..table.device_count())
            .filter_map(|device_id| table.table(device_id))
            .map(|t| t.host_buffer().size_bytes())
            .sum();
        let (cache_hits, cache_misses) = match (stats_before, self.cache.as_ref()) {
            (Some(before), Some(cache)) => {
                let after = cache.stats();
                (
                    Some(after.hits - before.hits),
                    Some(after.misses - before.misses),
                )
            }
            _ => (None, None),
        };

        info!(
            "Built {} hash table with {} entries in {} ms",
            table.hash_type(),
            table.entry_count(),
            build_time.as_millis()
        );

        Ok(HashTablePoint {
            build_ns: Some(build_time.as_nanos() as f64),
            hash_type: Some(table.hash_type().to_string()),
            entry_count: Some(table.entry_count()),
            shard_count: Some(table.shard_count()),
            hash_table_bytes: Some(hash_table_bytes),
            cache_hits,
            cache_misses,
            verified_probes: Some(verified_probes),
        })
    }

    /// Checks that the table returns each sampled key as often as the inner
    /// relation contains it.
    ///
    /// Replicated tables must contain all matches on every device. Sharded
    /// tables must contain them once across all devices.
    fn verify(&self, table: &JoinHashTable) -> Result<usize> {
        let null_key = i32::null_key() as i64;
        let device_count = table.device_count();

        for &key in &self.probe_keys {
            let expected = if key == null_key && !self.op.is_bw_eq() {
                0
            } else {
                self.key_counts.get(&key).copied().unwrap_or(0)
            };

            let matches: Vec<usize> = (0..device_count)
                .map(|device_id| table.probe(device_id, key).len())
                .collect();
            let is_valid = if table.shard_count() > 0 {
                matches.iter().sum::<usize>() == expected
            } else {
                matches.iter().all(|&m| m == expected)
            };

            if !is_valid {
                Err(ErrorKind::LogicError(format!(
                    "Key {} has {:?} matches on the devices, expected {}",
                    key, matches, expected
                )))?;
            }
        }

        Ok(self.probe_keys.len())
    }
}
