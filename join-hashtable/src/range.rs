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

//! Value ranges of join key columns.

use crate::error::{ErrorKind, Result};
use crate::expr::ColumnVar;
use crate::storage::InputTableInfo;
use std::collections::HashSet;

/// Largest number of buckets a hash table can have.
///
/// Row indices are stored as signed 32-bit integers.
pub const MAX_HASH_ENTRIES: usize = i32::MAX as usize;

/// An inclusive integer range with nullability.
///
/// An empty range is represented as `min = 0`, `max = -1`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct IntRange {
    pub min: i64,
    pub max: i64,
    pub has_nulls: bool,
}

impl IntRange {
    pub fn new(min: i64, max: i64, has_nulls: bool) -> Self {
        Self { min, max, has_nulls }
    }

    pub fn empty(has_nulls: bool) -> Self {
        Self {
            min: 0,
            max: -1,
            has_nulls,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }

    pub fn contains(&self, key: i64) -> bool {
        self.min <= key && key <= self.max
    }

    /// Smallest range that covers both ranges.
    pub fn union(&self, other: &IntRange) -> IntRange {
        let has_nulls = self.has_nulls || other.has_nulls;
        match (self.is_empty(), other.is_empty()) {
            (true, true) => IntRange::empty(has_nulls),
            (true, false) => IntRange { has_nulls, ..*other },
            (false, true) => IntRange { has_nulls, ..*self },
            (false, false) => IntRange::new(
                self.min.min(other.min),
                self.max.max(other.max),
                has_nulls,
            ),
        }
    }

    /// The key that `NULL` is mapped to by bitwise equality joins.
    ///
    /// `NULL` occupies the bucket after `max`.
    pub fn translated_null(&self) -> Result<i64> {
        if self.is_empty() {
            return Ok(self.min);
        }
        self.max.checked_add(1).ok_or_else(|| {
            ErrorKind::ColumnRangeInvalid(format!(
                "Cannot translate NULL above maximum key {}",
                self.max
            ))
            .into()
        })
    }

    /// Number of hash buckets required by the range.
    ///
    /// Bitwise equality joins reserve an additional bucket for `NULL`.
    pub fn bucket_count(&self, is_bw_eq: bool) -> Result<usize> {
        let span = if self.is_empty() {
            0_i128
        } else {
            self.max as i128 - self.min as i128 + 1
        };
        let buckets = span + if is_bw_eq { 1 } else { 0 };

        if buckets > MAX_HASH_ENTRIES as i128 {
            Err(ErrorKind::TooManyHashEntries(buckets as u64))?;
        }

        Ok(buckets as usize)
    }
}

/// The value range of an expression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExpressionRange {
    /// A bounded integer domain
    Integer(IntRange),
    FloatingPoint { min: f64, max: f64, has_nulls: bool },
    /// The range is unknown
    Invalid,
}

impl ExpressionRange {
    pub fn as_integer(&self) -> Option<&IntRange> {
        match self {
            ExpressionRange::Integer(range) => Some(range),
            _ => None,
        }
    }
}

/// Supplies the value ranges of columns from query metadata.
pub trait ValueRangeProvider: Send + Sync {
    /// Returns the value range of `col` within the fragments listed in
    /// `query_infos`. Tables in `skip_tables` are not considered.
    fn column_range(
        &self,
        col: &ColumnVar,
        query_infos: &[InputTableInfo],
        skip_tables: &HashSet<i32>,
    ) -> ExpressionRange;
}
