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

//! Hash table layouts and the mapping from keys to buckets.
//!
//! Keys are hashed with the identity function: the bucket of a key is its
//! offset from the minimum key of the column range. Bitwise equality joins
//! map `NULL` to the bucket after the maximum key.
//!
//! A one-to-one table is a dense array with one row index per bucket. A
//! one-to-many table stores, within one allocation, the per-bucket offsets,
//! the per-bucket counts, and the payload of row indices grouped by bucket:
//!
//! ```text
//! | offsets[entry_count] | counts[entry_count] | payload[rows] |
//! ```

use crate::error::{ErrorKind, Result};
use crate::range::{IntRange, MAX_HASH_ENTRIES};
use std::fmt;
use std::mem::size_of;

/// Slot value of an empty bucket in a one-to-one table.
pub const INVALID_SLOT: i32 = -1;

/// Layout kind of a hash table.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum HashType {
    /// Each key has at most one match
    OneToOne,
    /// Each key has any number of matches
    OneToMany,
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashType::OneToOne => write!(f, "OneToOne"),
            HashType::OneToMany => write!(f, "OneToMany"),
        }
    }
}

/// Placement of shards in the hash table of one device.
///
/// The table of a device holds `shards_per_device` sections, one for each
/// shard the device owns. Each section has `entry_count_per_shard` buckets.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ShardLayout {
    pub shard_count: usize,
    pub device_count: usize,
    pub device_id: usize,
    pub entry_count_per_shard: usize,
    pub shards_per_device: usize,
}

impl ShardLayout {
    pub fn new(
        bucket_count: usize,
        shard_count: usize,
        device_count: usize,
        device_id: usize,
    ) -> Result<Self> {
        if shard_count == 0 || device_count == 0 || device_id >= device_count {
            Err(ErrorKind::InvalidArgument(format!(
                "Invalid shard layout of {} shards on device {} of {}",
                shard_count, device_id, device_count
            )))?;
        }

        let entry_count_per_shard = (bucket_count + shard_count - 1) / shard_count;
        let shards_per_device = (shard_count + device_count - 1) / device_count;
        if entry_count_per_shard * shards_per_device > MAX_HASH_ENTRIES {
            Err(ErrorKind::TooManyHashEntries(
                (entry_count_per_shard * shards_per_device) as u64,
            ))?;
        }

        Ok(Self {
            shard_count,
            device_count,
            device_id,
            entry_count_per_shard,
            shards_per_device,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count_per_shard * self.shards_per_device
    }

    pub fn owns_shard(&self, shard: usize) -> bool {
        shard % self.device_count == self.device_id
    }
}

/// Maps join keys to bucket indices.
///
/// Builders and probes share the mapping, so that both agree on the bucket
/// of every key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct KeyMapping {
    pub min: i64,
    pub max: i64,
    /// The inline `NULL` value of the key type
    pub null_sentinel: i64,
    /// Key that `NULL` is translated to, only for bitwise equality
    pub translated_null: Option<i64>,
    /// Number of buckets in the table
    pub entry_count: usize,
    pub shard: Option<ShardLayout>,
}

impl KeyMapping {
    pub fn new(range: &IntRange, null_sentinel: i64, is_bw_eq: bool) -> Result<Self> {
        let translated_null = if is_bw_eq {
            Some(range.translated_null()?)
        } else {
            None
        };

        Ok(Self {
            min: range.min,
            max: range.max,
            null_sentinel,
            translated_null,
            entry_count: range.bucket_count(is_bw_eq)?,
            shard: None,
        })
    }

    /// Restricts the mapping to the shards owned by `device_id`.
    pub fn sharded(self, shard_count: usize, device_count: usize, device_id: usize) -> Result<Self> {
        let shard = ShardLayout::new(self.entry_count, shard_count, device_count, device_id)?;

        Ok(Self {
            entry_count: shard.entry_count(),
            shard: Some(shard),
            ..self
        })
    }

    /// Returns the bucket of `key`, or `None` if `key` can't have a match.
    ///
    /// Keys outside of `[min, max]`, `NULL` with regular equality, and keys
    /// of shards owned by other devices have no bucket.
    pub fn bucket(&self, key: i64) -> Option<usize> {
        let key = if key == self.null_sentinel {
            self.translated_null?
        } else if self.min <= key && key <= self.max {
            key
        } else {
            return None;
        };
        let offset = (key as i128 - self.min as i128) as usize;

        match self.shard {
            None => Some(offset),
            Some(layout) => {
                let shard = key.rem_euclid(layout.shard_count as i64) as usize;
                if layout.owns_shard(shard) {
                    Some(
                        (shard / layout.device_count) * layout.entry_count_per_shard
                            + offset / layout.shard_count,
                    )
                } else {
                    None
                }
            }
        }
    }

    /// Returns the bucket of a key on the build side.
    ///
    /// Unlike a probe, a non-null key outside of `[min, max]` is an error,
    /// because the column contradicts its range metadata.
    pub fn build_bucket(&self, key: i64) -> Result<Option<usize>> {
        if key != self.null_sentinel && (key < self.min || key > self.max) {
            Err(ErrorKind::KeyOutOfRange(key, self.min, self.max))?;
        }
        Ok(self.bucket(key))
    }
}

/// The buckets of a hash table in host memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HashLayout {
    /// One row index or `INVALID_SLOT` per bucket
    OneToOne(Vec<i32>),
    /// Offsets, counts, and payload in one buffer
    OneToMany { entry_count: usize, buffer: Vec<i32> },
}

impl HashLayout {
    /// Assembles a one-to-many layout from its three sections.
    pub fn one_to_many(offsets: &[i32], counts: &[i32], payload: &[i32]) -> Result<Self> {
        if offsets.len() != counts.len() {
            Err(ErrorKind::InvalidArgument(
                "Offsets and counts must have equal length".to_string(),
            ))?;
        }

        let mut buffer = Vec::with_capacity(offsets.len() * 2 + payload.len());
        buffer.extend_from_slice(offsets);
        buffer.extend_from_slice(counts);
        buffer.extend_from_slice(payload);

        Ok(HashLayout::OneToMany {
            entry_count: offsets.len(),
            buffer,
        })
    }

    pub fn hash_type(&self) -> HashType {
        match self {
            HashLayout::OneToOne(_) => HashType::OneToOne,
            HashLayout::OneToMany { .. } => HashType::OneToMany,
        }
    }

    pub fn entry_count(&self) -> usize {
        match self {
            HashLayout::OneToOne(slots) => slots.len(),
            HashLayout::OneToMany { entry_count, .. } => *entry_count,
        }
    }

    /// The complete buffer as laid out in memory.
    pub fn as_slice(&self) -> &[i32] {
        match self {
            HashLayout::OneToOne(slots) => slots,
            HashLayout::OneToMany { buffer, .. } => buffer,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.as_slice().len() * size_of::<i32>()
    }

    pub fn offsets(&self) -> Option<&[i32]> {
        match self {
            HashLayout::OneToOne(_) => None,
            HashLayout::OneToMany {
                entry_count,
                buffer,
            } => buffer.get(..*entry_count),
        }
    }

    pub fn counts(&self) -> Option<&[i32]> {
        match self {
            HashLayout::OneToOne(_) => None,
            HashLayout::OneToMany {
                entry_count,
                buffer,
            } => buffer.get(*entry_count..2 * *entry_count),
        }
    }

    pub fn payload(&self) -> Option<&[i32]> {
        match self {
            HashLayout::OneToOne(_) => None,
            HashLayout::OneToMany {
                entry_count,
                buffer,
            } => buffer.get(2 * *entry_count..),
        }
    }

    /// The row indices in `bucket`.
    ///
    /// Buckets beyond the table are empty.
    pub fn matches(&self, bucket: usize) -> &[i32] {
        match self {
            HashLayout::OneToOne(slots) => match slots.get(bucket) {
                Some(slot) if *slot != INVALID_SLOT => std::slice::from_ref(slot),
                _ => &[],
            },
            HashLayout::OneToMany { .. } => {
                let run = self
                    .offsets()
                    .zip(self.counts())
                    .zip(self.payload())
                    .and_then(|((offsets, counts), payload)| {
                        let start = *offsets.get(bucket)? as usize;
                        let count = *counts.get(bucket)? as usize;
                        payload.get(start..start + count)
                    });
                run.unwrap_or(&[])
            }
        }
    }
}

/// A hash table in host memory together with its key mapping.
///
/// Once built, the buffer is immutable. It is shared between the cache and
/// the hash tables that use it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HashTableBuffer {
    mapping: KeyMapping,
    layout: HashLayout,
}

impl HashTableBuffer {
    pub fn new(mapping: KeyMapping, layout: HashLayout) -> Result<Self> {
        if mapping.entry_count != layout.entry_count() {
            Err(ErrorKind::LogicError(format!(
                "Layout has {} buckets, but the key mapping {}",
                layout.entry_count(),
                mapping.entry_count
            )))?;
        }
        Ok(Self { mapping, layout })
    }

    pub fn key_mapping(&self) -> &KeyMapping {
        &self.mapping
    }

    pub fn layout(&self) -> &HashLayout {
        &self.layout
    }

    pub fn hash_type(&self) -> HashType {
        self.layout.hash_type()
    }

    pub fn entry_count(&self) -> usize {
        self.layout.entry_count()
    }

    pub fn size_bytes(&self) -> usize {
        self.layout.size_bytes()
    }

    /// Looks up the inner rows that match `key`.
    ///
    /// Returns an empty slice on a miss, one row index for a one-to-one
    /// table, and the run of row indices in scan order for a one-to-many
    /// table.
    pub fn probe(&self, key: i64) -> &[i32] {
        self.mapping
            .bucket(key)
            .map_or(&[], |bucket| self.layout.matches(bucket))
    }
}
