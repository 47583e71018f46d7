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

//! Process-wide cache of hash tables in host memory.
//!
//! Tables are keyed by value, i.e. by everything that determines their
//! content. Two builds with equal keys produce equal buffers. Concurrent
//! builds of the same absent key may thus both build, and the first
//! insertion wins.

use super::hash_layout::{HashTableBuffer, HashType, ShardLayout};
use crate::expr::{ColumnVar, Expr, JoinOp};
use crate::range::IntRange;
use crate::storage::ChunkKey;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Identity of a hash table's content.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HashTableCacheKey {
    pub col_range: IntRange,
    pub inner_col: ColumnVar,
    pub outer_col: Expr,
    pub num_elements: usize,
    pub chunk_key: ChunkKey,
    pub optype: JoinOp,
    pub hash_type: HashType,
    pub shard: Option<ShardLayout>,
}

/// Bounds of the cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_bytes: 4 << 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheEntry {
    buffer: Arc<HashTableBuffer>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<HashTableCacheKey, CacheEntry>,
    /// One-to-one keys whose build collided, with the colliding bucket
    collisions: HashMap<HashTableCacheKey, usize>,
    clock: u64,
    size_bytes: usize,
    stats: CacheStats,
}

/// A bounded cache with least-recently-used eviction.
///
/// Cached buffers are shared with the hash tables that use them. Evicting
/// a buffer only drops the cache's reference.
#[derive(Debug)]
pub struct HashTableCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl Default for HashTableCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl HashTableCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &HashTableCacheKey) -> Option<Arc<HashTableBuffer>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.clock += 1;

        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = state.clock;
                state.stats.hits += 1;
                debug!("Hash table cache hit for {:?}", key.chunk_key);
                Some(entry.buffer.clone())
            }
            None => {
                state.stats.misses += 1;
                debug!("Hash table cache miss for {:?}", key.chunk_key);
                None
            }
        }
    }

    /// Inserts `buffer` unless the key is already cached.
    ///
    /// Returns the cached buffer, which callers should use instead of their
    /// own copy. A buffer larger than the whole cache is not retained.
    pub fn insert(&self, key: HashTableCacheKey, buffer: Arc<HashTableBuffer>) -> Arc<HashTableBuffer> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.clock += 1;

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.last_used = state.clock;
            return entry.buffer.clone();
        }

        let size_bytes = buffer.size_bytes();
        if size_bytes > self.config.max_bytes || self.config.max_entries == 0 {
            warn!(
                "Hash table of {} bytes exceeds the cache capacity, not caching it",
                size_bytes
            );
            return buffer;
        }

        while state.entries.len() >= self.config.max_entries
            || state.size_bytes + size_bytes > self.config.max_bytes
        {
            if !state.evict_lru() {
                break;
            }
        }

        state.size_bytes += size_bytes;
        state.stats.insertions += 1;
        state.entries.insert(
            key,
            CacheEntry {
                buffer: buffer.clone(),
                last_used: state.clock,
            },
        );

        buffer
    }

    /// Remembers that the one-to-one table of `key` collides at `bucket`.
    ///
    /// Later builds of the same key can skip the one-to-one attempt. At most
    /// `max_entries` collisions are remembered.
    pub fn insert_collision(&self, key: HashTableCacheKey, bucket: usize) {
        if self.config.max_entries == 0 {
            return;
        }

        let mut state = self.state.lock();
        if !state.collisions.contains_key(&key)
            && state.collisions.len() >= self.config.max_entries
        {
            let victim = state.collisions.keys().next().cloned();
            if let Some(victim) = victim {
                state.collisions.remove(&victim);
            }
        }
        state.collisions.insert(key, bucket);
    }

    /// Returns the colliding bucket if the one-to-one table of `key` is
    /// known to collide.
    pub fn get_collision(&self, key: &HashTableCacheKey) -> Option<usize> {
        self.state.lock().collisions.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of the cached buffers.
    pub fn size_bytes(&self) -> usize {
        self.state.lock().size_bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.collisions.clear();
        state.size_bytes = 0;
    }
}

impl CacheState {
    fn evict_lru(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());

        match victim.and_then(|key| self.entries.remove_entry(&key)) {
            Some((key, entry)) => {
                let size_bytes = entry.buffer.size_bytes();
                self.size_bytes -= size_bytes;
                self.stats.evictions += 1;
                warn!(
                    "Evicted hash table of {} bytes for chunks {:?} from the cache",
                    size_bytes, key.chunk_key
                );
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::SqlType;
    use crate::join::hash_layout::{HashLayout, KeyMapping};
    use crate::storage::FragmentInfo;

    fn key(table_id: i32) -> HashTableCacheKey {
        let inner_col = ColumnVar::new(table_id, 0, 1, SqlType::Int);
        let fragment = FragmentInfo {
            fragment_id: 0,
            shard_id: None,
            num_tuples: 4,
            chunk_stats: HashMap::new(),
        };
        HashTableCacheKey {
            col_range: IntRange::new(0, 3, false),
            chunk_key: ChunkKey::for_fragments(&inner_col, &[fragment]),
            inner_col,
            outer_col: Expr::Column(ColumnVar::new(100, 0, 0, SqlType::Int)),
            num_elements: 4,
            optype: JoinOp::Eq,
            hash_type: HashType::OneToOne,
            shard: None,
        }
    }

    fn buffer(slots: Vec<i32>) -> Arc<HashTableBuffer> {
        let mapping = KeyMapping::new(
            &IntRange::new(0, slots.len() as i64 - 1, false),
            i32::MIN as i64,
            false,
        )
        .unwrap();
        Arc::new(HashTableBuffer::new(mapping, HashLayout::OneToOne(slots)).unwrap())
    }

    #[test]
    fn first_insertion_wins() {
        let cache = HashTableCache::default();
        let first = cache.insert(key(1), buffer(vec![0, 1, 2, 3]));
        let second = cache.insert(key(1), buffer(vec![0, 1, 2, 3]));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().insertions, 1);
    }

    #[test]
    fn hits_and_misses() {
        let cache = HashTableCache::default();

        assert!(cache.get(&key(1)).is_none());
        cache.insert(key(1), buffer(vec![3, 2, 1, 0]));
        assert!(cache.get(&key(1)).is_some());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn hash_type_is_part_of_the_key() {
        let cache = HashTableCache::default();
        cache.insert(key(1), buffer(vec![0, 1, 2, 3]));

        let mut one_to_many = key(1);
        one_to_many.hash_type = HashType::OneToMany;
        assert!(cache.get(&one_to_many).is_none());
    }

    #[test]
    fn remembers_collisions() {
        let cache = HashTableCache::new(CacheConfig {
            max_entries: 1,
            max_bytes: 1 << 20,
        });
        assert_eq!(cache.get_collision(&key(1)), None);

        cache.insert_collision(key(1), 2);
        assert_eq!(cache.get_collision(&key(1)), Some(2));
        assert!(cache.is_empty());

        cache.insert_collision(key(2), 0);
        assert_eq!(cache.get_collision(&key(1)), None);
        assert_eq!(cache.get_collision(&key(2)), Some(0));

        cache.clear();
        assert_eq!(cache.get_collision(&key(2)), None);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = HashTableCache::new(CacheConfig {
            max_entries: 2,
            max_bytes: 1 << 20,
        });
        cache.insert(key(1), buffer(vec![0; 4]));
        cache.insert(key(2), buffer(vec![0; 4]));
        cache.get(&key(1));
        cache.insert(key(3), buffer(vec![0; 4]));

        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(3)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn byte_bound() {
        let cache = HashTableCache::new(CacheConfig {
            max_entries: 16,
            max_bytes: 32,
        });
        cache.insert(key(1), buffer(vec![0; 4]));
        cache.insert(key(2), buffer(vec![0; 4]));
        assert_eq!(cache.size_bytes(), 32);

        cache.insert(key(3), buffer(vec![0; 4]));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size_bytes(), 32);

        let huge = cache.insert(key(4), buffer(vec![0; 64]));
        assert_eq!(huge.entry_count(), 64);
        assert!(cache.get(&key(4)).is_none());
    }
}
