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

//! Hash table builders in host memory.
//!
//! The one-to-one builder inserts rows in parallel and stops at the first
//! bucket that receives a second row. The one-to-many builder is a two-pass
//! counting sort: count rows per bucket, compute the offsets with an
//! exclusive prefix sum, and scatter the row indices in scan order.

use super::hash_layout::{HashLayout, HashType, KeyMapping, INVALID_SLOT};
use crate::error::{Error, ErrorKind, Result};
use crate::range::MAX_HASH_ENTRIES;
use crate::storage::ColumnBuffer;
use rayon::prelude::*;
use std::sync::atomic::{AtomicI32, Ordering};

/// Result of an attempt to fill a hash table.
#[derive(Debug)]
pub enum FillOutcome<T> {
    Complete(T),
    /// Two rows fell into `bucket` of a one-to-one table
    Collision { bucket: usize },
}

impl<T> FillOutcome<T> {
    pub fn is_collision(&self) -> bool {
        match self {
            FillOutcome::Collision { .. } => true,
            FillOutcome::Complete(_) => false,
        }
    }
}

enum Abort {
    Collision(usize),
    Failed(Error),
}

impl From<Error> for Abort {
    fn from(error: Error) -> Self {
        Abort::Failed(error)
    }
}

/// Builds a hash table of `hash_type` over the values of `column`.
pub fn fill_hash_table(
    hash_type: HashType,
    column: &ColumnBuffer,
    mapping: &KeyMapping,
) -> Result<FillOutcome<HashLayout>> {
    match hash_type {
        HashType::OneToOne => fill_one_to_one(column, mapping),
        HashType::OneToMany => fill_one_to_many(column, mapping).map(FillOutcome::Complete),
    }
}

pub fn fill_one_to_one(column: &ColumnBuffer, mapping: &KeyMapping) -> Result<FillOutcome<HashLayout>> {
    check_row_count(column)?;
    match column {
        ColumnBuffer::Int16(values) => fill_one_to_one_impl(values, mapping),
        ColumnBuffer::Int32(values) => fill_one_to_one_impl(values, mapping),
        ColumnBuffer::Int64(values) => fill_one_to_one_impl(values, mapping),
    }
}

pub fn fill_one_to_many(column: &ColumnBuffer, mapping: &KeyMapping) -> Result<HashLayout> {
    check_row_count(column)?;
    match column {
        ColumnBuffer::Int16(values) => fill_one_to_many_impl(values, mapping),
        ColumnBuffer::Int32(values) => fill_one_to_many_impl(values, mapping),
        ColumnBuffer::Int64(values) => fill_one_to_many_impl(values, mapping),
    }
}

fn check_row_count(column: &ColumnBuffer) -> Result<()> {
    if column.len() > MAX_HASH_ENTRIES {
        Err(ErrorKind::TooManyHashEntries(column.len() as u64))?;
    }
    Ok(())
}

fn fill_one_to_one_impl<T>(values: &[T], mapping: &KeyMapping) -> Result<FillOutcome<HashLayout>>
where
    T: Copy + Into<i64> + Sync,
{
    let slots: Vec<AtomicI32> = (0..mapping.entry_count)
        .map(|_| AtomicI32::new(INVALID_SLOT))
        .collect();

    let filled = values
        .par_iter()
        .enumerate()
        .try_for_each(|(row, &value)| -> std::result::Result<(), Abort> {
            if let Some(bucket) = mapping.build_bucket(value.into())? {
                slots[bucket]
                    .compare_exchange(INVALID_SLOT, row as i32, Ordering::Relaxed, Ordering::Relaxed)
                    .map_err(|_| Abort::Collision(bucket))?;
            }
            Ok(())
        });

    match filled {
        Ok(()) => Ok(FillOutcome::Complete(HashLayout::OneToOne(
            slots.into_iter().map(AtomicI32::into_inner).collect(),
        ))),
        Err(Abort::Collision(bucket)) => Ok(FillOutcome::Collision { bucket }),
        Err(Abort::Failed(error)) => Err(error),
    }
}

fn fill_one_to_many_impl<T>(values: &[T], mapping: &KeyMapping) -> Result<HashLayout>
where
    T: Copy + Into<i64> + Sync,
{
    let entry_count = mapping.entry_count;

    // First pass: count rows per bucket
    let atomic_counts: Vec<AtomicI32> = (0..entry_count).map(|_| AtomicI32::new(0)).collect();
    values.par_iter().try_for_each(|&value| -> Result<()> {
        if let Some(bucket) = mapping.build_bucket(value.into())? {
            atomic_counts[bucket].fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    })?;

    let mut buffer = vec![0_i32; 2 * entry_count];
    let (offsets, counts) = buffer.split_at_mut(entry_count);
    counts
        .iter_mut()
        .zip(atomic_counts.into_iter())
        .for_each(|(count, atomic)| *count = atomic.into_inner());

    // Exclusive prefix sum
    let total = counts.iter().zip(offsets.iter_mut()).fold(0_i32, |sum, (count, offset)| {
        *offset = sum;
        sum + count
    });

    // Second pass: scatter row indices in scan order
    buffer.resize(2 * entry_count + total as usize, INVALID_SLOT);
    let (header, payload) = buffer.split_at_mut(2 * entry_count);
    let offsets = &header[..entry_count];
    let mut fill = vec![0_i32; entry_count];
    for (row, &value) in values.iter().enumerate() {
        if let Some(bucket) = mapping.bucket(value.into()) {
            payload[(offsets[bucket] + fill[bucket]) as usize] = row as i32;
            fill[bucket] += 1;
        }
    }

    Ok(HashLayout::OneToMany {
        entry_count,
        buffer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::IntRange;

    fn mapping(min: i64, max: i64, is_bw_eq: bool) -> KeyMapping {
        KeyMapping::new(&IntRange::new(min, max, true), i32::MIN as i64, is_bw_eq).unwrap()
    }

    #[test]
    fn one_to_one_detects_collision() {
        let column: ColumnBuffer = vec![5_i32, 7, 5, 9].into();

        match fill_one_to_one(&column, &mapping(5, 9, false)).unwrap() {
            FillOutcome::Collision { bucket } => assert_eq!(bucket, 0),
            other => panic!("Expected collision, got {:?}", other),
        }
    }

    #[test]
    fn one_to_many_example() {
        let column: ColumnBuffer = vec![5_i32, 7, 5, 9].into();
        let layout = fill_one_to_many(&column, &mapping(5, 9, false)).unwrap();

        assert_eq!(layout.counts().unwrap(), &[2, 0, 1, 0, 1]);
        assert_eq!(layout.offsets().unwrap(), &[0, 2, 2, 3, 3]);
        assert_eq!(layout.payload().unwrap(), &[0, 2, 1, 3]);
    }

    #[test]
    fn one_to_one_unique_keys() {
        let column: ColumnBuffer = vec![9_i64, i64::MIN, 5, 6].into();
        let m = KeyMapping::new(&IntRange::new(5, 9, true), i64::MIN, false).unwrap();

        match fill_one_to_one(&column, &m).unwrap() {
            FillOutcome::Complete(HashLayout::OneToOne(slots)) => {
                assert_eq!(slots, vec![2, 3, INVALID_SLOT, INVALID_SLOT, 0])
            }
            other => panic!("Expected one-to-one table, got {:?}", other),
        }
    }

    #[test]
    fn nulls_share_a_bucket_with_bitwise_equality() {
        let column: ColumnBuffer = vec![i16::MIN, 1_i16, i16::MIN].into();
        let m = KeyMapping::new(&IntRange::new(1, 1, true), i16::MIN as i64, true).unwrap();
        let layout = fill_one_to_many(&column, &m).unwrap();

        assert_eq!(layout.matches(1), &[0, 2]);
        assert_eq!(layout.matches(0), &[1]);
    }

    #[test]
    fn stale_range_fails_build() {
        let column: ColumnBuffer = vec![5_i32, 17].into();

        match fill_one_to_many(&column, &mapping(5, 9, false)).map_err(|e| e.0) {
            Err(ErrorKind::KeyOutOfRange(17, 5, 9)) => {}
            other => panic!("Expected key out of range, got {:?}", other),
        }
        assert!(fill_one_to_one(&column, &mapping(5, 9, false)).is_err());
    }

    #[test]
    fn empty_column() {
        let column = ColumnBuffer::empty(crate::expr::SqlType::Int).unwrap();
        let m = KeyMapping::new(&IntRange::empty(false), i32::MIN as i64, false).unwrap();

        match fill_hash_table(HashType::OneToOne, &column, &m).unwrap() {
            FillOutcome::Complete(layout) => assert_eq!(layout.entry_count(), 0),
            other => panic!("Expected empty table, got {:?}", other),
        }
        assert_eq!(fill_one_to_many(&column, &m).unwrap().as_slice(), &[] as &[i32]);
    }
}
