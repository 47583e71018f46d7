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

use crate::error::{ErrorKind, Result};
use crate::expr::ColumnVar;
use crate::storage::{ColumnBuffer, ColumnFetcher, FragmentInfo};
use device_mem::runtime::memory::MemoryLevel;
use log::debug;
use parking_lot::Mutex;

/// Fetches the inner column of a hash table, and linearizes columns that
/// span multiple fragments.
///
/// The linear buffer is materialized once and shared by all devices of one
/// hash table. Devices that read a different set of fragments, e.g. the
/// shards of another device, linearize their own copy.
#[derive(Debug)]
pub struct ColumnLinearizer {
    max_fragments: usize,
    linearized: Mutex<Option<(Vec<i32>, ColumnBuffer)>>,
}

impl ColumnLinearizer {
    pub fn new(max_fragments: usize) -> Self {
        Self {
            max_fragments,
            linearized: Mutex::new(None),
        }
    }

    /// Returns the values of `col` in `fragments` as one contiguous buffer.
    pub fn fetch_column(
        &self,
        fetcher: &dyn ColumnFetcher,
        col: &ColumnVar,
        fragments: &[FragmentInfo],
    ) -> Result<ColumnBuffer> {
        match fragments {
            [] => ColumnBuffer::empty(col.sql_type),
            [fragment] => fetcher.fetch_fragment(col, fragment, MemoryLevel::Cpu, 0),
            _ => self.linearize(fetcher, col, fragments),
        }
    }

    fn linearize(
        &self,
        fetcher: &dyn ColumnFetcher,
        col: &ColumnVar,
        fragments: &[FragmentInfo],
    ) -> Result<ColumnBuffer> {
        if fragments.len() > self.max_fragments {
            Err(ErrorKind::TooManyFragments(col.table_id, fragments.len()))?;
        }

        let fragment_ids: Vec<i32> = fragments.iter().map(|f| f.fragment_id).collect();

        // Hold the lock while materializing, so that concurrent devices wait
        // for the first one instead of copying the column again
        let mut linearized = self.linearized.lock();
        if let Some((ids, column)) = linearized.as_ref() {
            if *ids == fragment_ids {
                debug!("Reusing linearized column {}", col.name);
                return Ok(column.clone());
            }
        }

        let parts = fragments
            .iter()
            .map(|fragment| fetcher.fetch_fragment(col, fragment, MemoryLevel::Cpu, 0))
            .collect::<Result<Vec<_>>>()?;
        let column = ColumnBuffer::concat(&parts)?;
        debug!(
            "Linearized {} fragments of column {} into {} bytes",
            fragments.len(),
            col.name,
            column.size_bytes()
        );

        if linearized.is_none() {
            *linearized = Some((fragment_ids, column.clone()));
        }

        Ok(column)
    }
}
