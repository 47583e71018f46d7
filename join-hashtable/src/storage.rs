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

//! Access to the fragments and column chunks of input tables.
//!
//! Tables are horizontally split into fragments. Each fragment stores one
//! chunk per column and carries the value range of each chunk as metadata.
//! Sharded tables assign each fragment to exactly one shard.

use crate::error::{ErrorKind, Result};
use crate::expr::{ColumnVar, Expr, JoinKey, SqlType};
use crate::range::{ExpressionRange, IntRange, ValueRangeProvider};
use device_mem::runtime::memory::{DeviceId, MemoryLevel};
use log::trace;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::mem::size_of;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Metadata of one table fragment.
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentInfo {
    pub fragment_id: i32,
    /// The shard that the fragment belongs to, if the table is sharded
    pub shard_id: Option<usize>,
    pub num_tuples: usize,
    /// Value range of each column chunk, keyed by column id
    pub chunk_stats: HashMap<i32, IntRange>,
}

/// Distribution of a table's rows.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TablePartitioning {
    /// All rows are visible everywhere
    Replicated,
    /// Rows are assigned to shards by `key mod shard_count` of a column
    Sharded { column_id: i32, shard_count: usize },
    /// Rows are spread over nodes without a usable shard key
    Partitioned,
}

/// The fragments of an input table that a query reads.
#[derive(Clone, Debug, PartialEq)]
pub struct InputTableInfo {
    pub table_id: i32,
    pub fragments: Vec<FragmentInfo>,
    pub partitioning: TablePartitioning,
}

/// Physical identity of the chunks that back a column.
///
/// Consists of the table id, the column id, and the fragment ids.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChunkKey(Vec<i32>);

impl ChunkKey {
    pub fn for_fragments(col: &ColumnVar, fragments: &[FragmentInfo]) -> Self {
        let mut key = Vec::with_capacity(fragments.len() + 2);
        key.push(col.table_id);
        key.push(col.column_id);
        key.extend(fragments.iter().map(|f| f.fragment_id));
        ChunkKey(key)
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    pub fn table_id(&self) -> i32 {
        self.0[0]
    }
}

/// A typed, read-only view of column values.
///
/// `NULL` is stored inline as the smallest value of the type.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnBuffer {
    Int16(Arc<[i16]>),
    Int32(Arc<[i32]>),
    Int64(Arc<[i64]>),
}

macro_rules! map_column {
    ($buffer:expr, $values:ident => $body:expr) => {
        match $buffer {
            ColumnBuffer::Int16($values) => ColumnBuffer::Int16($body),
            ColumnBuffer::Int32($values) => ColumnBuffer::Int32($body),
            ColumnBuffer::Int64($values) => ColumnBuffer::Int64($body),
        }
    };
}

impl ColumnBuffer {
    /// An empty buffer with the storage type of `sql_type`.
    pub fn empty(sql_type: SqlType) -> Result<Self> {
        match sql_type {
            SqlType::SmallInt => Ok(Vec::<i16>::new().into()),
            SqlType::Int | SqlType::DictText { .. } => Ok(Vec::<i32>::new().into()),
            SqlType::BigInt | SqlType::Date => Ok(Vec::<i64>::new().into()),
            other => Err(ErrorKind::InvalidArgument(format!(
                "Type {} is not stored as an integer column",
                other
            ))
            .into()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnBuffer::Int16(v) => v.len(),
            ColumnBuffer::Int32(v) => v.len(),
            ColumnBuffer::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            ColumnBuffer::Int16(v) => v.len() * size_of::<i16>(),
            ColumnBuffer::Int32(v) => v.len() * size_of::<i32>(),
            ColumnBuffer::Int64(v) => v.len() * size_of::<i64>(),
        }
    }

    pub fn null_sentinel(&self) -> i64 {
        match self {
            ColumnBuffer::Int16(_) => i16::MIN as i64,
            ColumnBuffer::Int32(_) => i32::MIN as i64,
            ColumnBuffer::Int64(_) => i64::MIN,
        }
    }

    /// Returns true if the buffer can hold values of `sql_type`.
    pub fn stores_type(&self, sql_type: SqlType) -> bool {
        sql_type.null_sentinel() == Some(self.null_sentinel())
    }

    pub fn get(&self, row: usize) -> Option<i64> {
        match self {
            ColumnBuffer::Int16(v) => v.get(row).map(|&x| x as i64),
            ColumnBuffer::Int32(v) => v.get(row).map(|&x| x as i64),
            ColumnBuffer::Int64(v) => v.get(row).copied(),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = i64> + '_> {
        match self {
            ColumnBuffer::Int16(v) => Box::new(v.iter().map(|&x| x as i64)),
            ColumnBuffer::Int32(v) => Box::new(v.iter().map(|&x| x as i64)),
            ColumnBuffer::Int64(v) => Box::new(v.iter().copied()),
        }
    }

    /// Value range of the non-null values.
    pub fn value_range(&self) -> IntRange {
        let null = self.null_sentinel();
        self.iter().fold(IntRange::empty(false), |range, x| {
            if x == null {
                IntRange {
                    has_nulls: true,
                    ..range
                }
            } else {
                range.union(&IntRange::new(x, x, false))
            }
        })
    }

    pub fn slice(&self, rows: Range<usize>) -> Result<Self> {
        if rows.start > rows.end || rows.end > self.len() {
            Err(ErrorKind::InvalidArgument(format!(
                "Rows {:?} out of bounds of column with {} rows",
                rows,
                self.len()
            )))?;
        }
        Ok(map_column!(self, v => Arc::from(&v[rows])))
    }

    /// Collects the values at `rows` into a new buffer.
    pub fn gather(&self, rows: &[usize]) -> Result<Self> {
        if let Some(&row) = rows.iter().find(|&&row| row >= self.len()) {
            Err(ErrorKind::InvalidArgument(format!(
                "Row {} out of bounds of column with {} rows",
                row,
                self.len()
            )))?;
        }
        Ok(map_column!(self, v => rows.iter().map(|&row| v[row]).collect()))
    }

    /// Concatenates buffers of the same type into one linear buffer.
    pub fn concat(parts: &[ColumnBuffer]) -> Result<Self> {
        let first = parts.first().ok_or_else(|| {
            ErrorKind::InvalidArgument("Cannot concatenate zero column buffers".to_string())
        })?;

        match first {
            ColumnBuffer::Int16(_) => concat_typed(parts, |p| match p {
                ColumnBuffer::Int16(v) => Some(v),
                _ => None,
            })
            .map(ColumnBuffer::Int16),
            ColumnBuffer::Int32(_) => concat_typed(parts, |p| match p {
                ColumnBuffer::Int32(v) => Some(v),
                _ => None,
            })
            .map(ColumnBuffer::Int32),
            ColumnBuffer::Int64(_) => concat_typed(parts, |p| match p {
                ColumnBuffer::Int64(v) => Some(v),
                _ => None,
            })
            .map(ColumnBuffer::Int64),
        }
    }
}

fn concat_typed<T, F>(parts: &[ColumnBuffer], extract: F) -> Result<Arc<[T]>>
where
    T: Copy,
    F: Fn(&ColumnBuffer) -> Option<&Arc<[T]>>,
{
    let len = parts.iter().map(ColumnBuffer::len).sum();
    let mut linear = Vec::with_capacity(len);
    for part in parts {
        let values = extract(part).ok_or_else(|| {
            ErrorKind::InvalidArgument("Cannot concatenate columns of different types".to_string())
        })?;
        linear.extend_from_slice(values);
    }
    Ok(linear.into())
}

impl From<Vec<i16>> for ColumnBuffer {
    fn from(values: Vec<i16>) -> Self {
        ColumnBuffer::Int16(values.into())
    }
}

impl From<Vec<i32>> for ColumnBuffer {
    fn from(values: Vec<i32>) -> Self {
        ColumnBuffer::Int32(values.into())
    }
}

impl From<Vec<i64>> for ColumnBuffer {
    fn from(values: Vec<i64>) -> Self {
        ColumnBuffer::Int64(values.into())
    }
}

/// Supplies column chunks from storage.
pub trait ColumnFetcher: Send + Sync {
    /// Returns the values of `col` in one fragment, materialized at
    /// `memory_level`.
    ///
    /// Fails with `FailedToFetchColumn` if the chunk cannot be materialized
    /// at the requested level.
    fn fetch_fragment(
        &self,
        col: &ColumnVar,
        fragment: &FragmentInfo,
        memory_level: MemoryLevel,
        device_id: DeviceId,
    ) -> Result<ColumnBuffer>;
}

/// Finds the metadata of the inner table.
pub fn get_inner_query_info(table_id: i32, query_infos: &[InputTableInfo]) -> Result<&InputTableInfo> {
    query_infos
        .iter()
        .find(|info| info.table_id == table_id)
        .ok_or_else(|| {
            ErrorKind::UnsupportedJoin(format!("Table {} is not an input of the query", table_id))
                .into()
        })
}

/// Number of shards that the join can exploit, or zero.
///
/// Both sides must be columns that are the shard keys of their tables, with
/// equal shard counts.
pub fn get_shard_count(key: &JoinKey, query_infos: &[InputTableInfo]) -> usize {
    let shard_count_of = |col: &ColumnVar| {
        query_infos
            .iter()
            .find(|info| info.table_id == col.table_id)
            .and_then(|info| match info.partitioning {
                TablePartitioning::Sharded {
                    column_id,
                    shard_count,
                } if column_id == col.column_id => Some(shard_count),
                _ => None,
            })
    };

    let outer = match &key.outer {
        Expr::Column(col) => col,
        Expr::Derived { .. } => return 0,
    };

    match (shard_count_of(&key.inner), shard_count_of(outer)) {
        (Some(inner), Some(outer)) if inner == outer => inner,
        _ => 0,
    }
}

/// Selects the fragments whose shard is owned by `device_id`.
///
/// Device `d` owns the shards `s` with `s mod device_count == d`.
pub fn only_shards_for_device(
    fragments: &[FragmentInfo],
    device_id: DeviceId,
    device_count: u32,
) -> Result<Vec<FragmentInfo>> {
    if device_count == 0 {
        Err(ErrorKind::InvalidArgument("Device count must be positive".to_string()))?;
    }

    fragments
        .iter()
        .filter_map(|fragment| match fragment.shard_id {
            Some(shard) if shard % device_count as usize == device_id as usize => {
                Some(Ok(fragment.clone()))
            }
            Some(_) => None,
            None => Some(Err(ErrorKind::LogicError(format!(
                "Fragment {} of a sharded table has no shard",
                fragment.fragment_id
            ))
            .into())),
        })
        .collect()
}

/// Computes the value range of a column from the chunk metadata of the
/// fragments in `query_infos`.
pub fn column_range_from_metadata(
    col: &ColumnVar,
    query_infos: &[InputTableInfo],
    skip_tables: &HashSet<i32>,
) -> ExpressionRange {
    if !col.sql_type.is_integer_like() || skip_tables.contains(&col.table_id) {
        return ExpressionRange::Invalid;
    }

    query_infos
        .iter()
        .find(|info| info.table_id == col.table_id)
        .and_then(|info| {
            info.fragments
                .iter()
                .try_fold(IntRange::empty(false), |range, fragment| {
                    fragment
                        .chunk_stats
                        .get(&col.column_id)
                        .map(|stats| range.union(stats))
                })
        })
        .map_or(ExpressionRange::Invalid, ExpressionRange::Integer)
}

#[derive(Debug)]
struct StoredFragment {
    info: FragmentInfo,
    columns: HashMap<i32, ColumnBuffer>,
}

#[derive(Debug)]
struct StoredTable {
    partitioning: TablePartitioning,
    fragments: Vec<StoredFragment>,
}

/// In-memory table storage.
///
/// Serves column chunks from host memory and derives value ranges from the
/// chunk metadata.
#[derive(Debug, Default)]
pub struct TableStore {
    tables: RwLock<HashMap<i32, StoredTable>>,
    fetch_count: AtomicUsize,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, table_id: i32, partitioning: TablePartitioning) -> Result<()> {
        if let TablePartitioning::Sharded { shard_count: 0, .. } = partitioning {
            Err(ErrorKind::InvalidArgument("Shard count must be positive".to_string()))?;
        }

        let mut tables = self.tables.write();
        if tables.contains_key(&table_id) {
            Err(ErrorKind::InvalidArgument(format!("Table {} already exists", table_id)))?;
        }
        tables.insert(
            table_id,
            StoredTable {
                partitioning,
                fragments: Vec::new(),
            },
        );

        Ok(())
    }

    /// Appends a fragment and returns its id.
    ///
    /// All columns must have the same number of rows.
    pub fn append_fragment(
        &self,
        table_id: i32,
        shard_id: Option<usize>,
        columns: Vec<(i32, ColumnBuffer)>,
    ) -> Result<i32> {
        let num_tuples = columns.first().map_or(0, |(_, c)| c.len());
        if columns.iter().any(|(_, c)| c.len() != num_tuples) {
            Err(ErrorKind::InvalidArgument(
                "Columns of a fragment must have equal length".to_string(),
            ))?;
        }

        let mut tables = self.tables.write();
        let table = tables.get_mut(&table_id).ok_or_else(|| {
            ErrorKind::InvalidArgument(format!("Table {} doesn't exist", table_id))
        })?;
        match (table.partitioning, shard_id) {
            (TablePartitioning::Sharded { shard_count, .. }, Some(shard)) if shard < shard_count => {}
            (TablePartitioning::Sharded { .. }, _) => Err(ErrorKind::InvalidArgument(format!(
                "Fragment of sharded table {} requires a valid shard id, got {:?}",
                table_id, shard_id
            )))?,
            (_, None) => {}
            (_, Some(_)) => Err(ErrorKind::InvalidArgument(format!(
                "Table {} is not sharded",
                table_id
            )))?,
        }

        let fragment_id = table.fragments.len() as i32;
        let chunk_stats = columns
            .iter()
            .map(|(column_id, column)| (*column_id, column.value_range()))
            .collect();
        table.fragments.push(StoredFragment {
            info: FragmentInfo {
                fragment_id,
                shard_id,
                num_tuples,
                chunk_stats,
            },
            columns: columns.into_iter().collect(),
        });

        Ok(fragment_id)
    }

    /// Appends rows as fragments of at most `fragment_size` rows.
    ///
    /// Rows of sharded tables are routed to the shard of their shard key.
    /// `NULL` shard keys go to shard 0.
    pub fn load_columns(
        &self,
        table_id: i32,
        columns: Vec<(i32, ColumnBuffer)>,
        fragment_size: usize,
    ) -> Result<()> {
        if fragment_size == 0 {
            Err(ErrorKind::InvalidArgument("Fragment size must be positive".to_string()))?;
        }
        let partitioning = self
            .tables
            .read()
            .get(&table_id)
            .map(|table| table.partitioning)
            .ok_or_else(|| ErrorKind::InvalidArgument(format!("Table {} doesn't exist", table_id)))?;

        let num_rows = columns.first().map_or(0, |(_, c)| c.len());
        let shards: Vec<(Option<usize>, Vec<(i32, ColumnBuffer)>)> = match partitioning {
            TablePartitioning::Sharded {
                column_id,
                shard_count,
            } => {
                let shard_column = columns
                    .iter()
                    .find(|(id, _)| *id == column_id)
                    .map(|(_, c)| c)
                    .ok_or_else(|| {
                        ErrorKind::InvalidArgument(format!("Shard column {} is missing", column_id))
                    })?;
                let null = shard_column.null_sentinel();
                let mut rows_per_shard = vec![Vec::new(); shard_count];
                for (row, key) in shard_column.iter().enumerate() {
                    let shard = if key == null {
                        0
                    } else {
                        key.rem_euclid(shard_count as i64) as usize
                    };
                    rows_per_shard[shard].push(row);
                }

                rows_per_shard
                    .iter()
                    .enumerate()
                    .map(|(shard, rows)| {
                        let gathered = columns
                            .iter()
                            .map(|(id, c)| c.gather(rows).map(|g| (*id, g)))
                            .collect::<Result<_>>()?;
                        Ok((Some(shard), gathered))
                    })
                    .collect::<Result<_>>()?
            }
            _ => vec![(None, columns)],
        };

        for (shard_id, shard_columns) in shards {
            let len = shard_columns.first().map_or(0, |(_, c)| c.len());
            let mut start = 0;
            while start < len {
                let end = (start + fragment_size).min(len);
                let fragment = shard_columns
                    .iter()
                    .map(|(id, c)| c.slice(start..end).map(|s| (*id, s)))
                    .collect::<Result<_>>()?;
                self.append_fragment(table_id, shard_id, fragment)?;
                start = end;
            }
        }

        trace!("Loaded {} rows into table {}", num_rows, table_id);
        Ok(())
    }

    /// Metadata of all fragments of a table.
    pub fn table_info(&self, table_id: i32) -> Result<InputTableInfo> {
        let tables = self.tables.read();
        let table = tables.get(&table_id).ok_or_else(|| {
            ErrorKind::InvalidArgument(format!("Table {} doesn't exist", table_id))
        })?;

        Ok(InputTableInfo {
            table_id,
            fragments: table.fragments.iter().map(|f| f.info.clone()).collect(),
            partitioning: table.partitioning,
        })
    }

    /// Number of chunks fetched so far.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::Relaxed)
    }
}

impl ColumnFetcher for TableStore {
    fn fetch_fragment(
        &self,
        col: &ColumnVar,
        fragment: &FragmentInfo,
        memory_level: MemoryLevel,
        _device_id: DeviceId,
    ) -> Result<ColumnBuffer> {
        if memory_level.is_gpu() {
            Err(ErrorKind::FailedToFetchColumn(format!(
                "{} can only be materialized in host memory",
                col.name
            )))?;
        }

        let tables = self.tables.read();
        let column = tables
            .get(&col.table_id)
            .and_then(|table| {
                table
                    .fragments
                    .iter()
                    .find(|f| f.info.fragment_id == fragment.fragment_id)
            })
            .and_then(|f| f.columns.get(&col.column_id))
            .ok_or_else(|| {
                ErrorKind::FailedToFetchColumn(format!(
                    "No chunk of {} in fragment {}",
                    col.name, fragment.fragment_id
                ))
            })?;
        if !column.stores_type(col.sql_type) {
            Err(ErrorKind::FailedToFetchColumn(format!(
                "Chunk of {} doesn't store type {}",
                col.name, col.sql_type
            )))?;
        }

        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        Ok(column.clone())
    }
}

impl ValueRangeProvider for TableStore {
    fn column_range(
        &self,
        col: &ColumnVar,
        query_infos: &[InputTableInfo],
        skip_tables: &HashSet<i32>,
    ) -> ExpressionRange {
        column_range_from_metadata(col, query_infos, skip_tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_have_chunk_stats() {
        let store = TableStore::new();
        store.create_table(1, TablePartitioning::Replicated).unwrap();
        store
            .load_columns(1, vec![(0, vec![4_i32, i32::MIN, 9, 2, 7].into())], 2)
            .unwrap();

        let info = store.table_info(1).unwrap();
        let stats: Vec<_> = info.fragments.iter().map(|f| f.chunk_stats[&0]).collect();

        assert_eq!(
            stats,
            vec![
                IntRange::new(4, 4, true),
                IntRange::new(2, 9, false),
                IntRange::new(7, 7, false)
            ]
        );
    }

    #[test]
    fn range_from_metadata() {
        let store = TableStore::new();
        store.create_table(1, TablePartitioning::Replicated).unwrap();
        store
            .load_columns(1, vec![(0, vec![4_i64, i64::MIN, 9, -2].into())], 3)
            .unwrap();
        let infos = vec![store.table_info(1).unwrap()];
        let col = ColumnVar::new(1, 0, 1, SqlType::BigInt);

        assert_eq!(
            store.column_range(&col, &infos, &HashSet::new()),
            ExpressionRange::Integer(IntRange::new(-2, 9, true))
        );

        let skip: HashSet<i32> = [1].iter().copied().collect();
        assert_eq!(store.column_range(&col, &infos, &skip), ExpressionRange::Invalid);
    }

    #[test]
    fn sharded_load_routes_rows() {
        let store = TableStore::new();
        store
            .create_table(
                1,
                TablePartitioning::Sharded {
                    column_id: 0,
                    shard_count: 3,
                },
            )
            .unwrap();
        store
            .load_columns(1, vec![(0, vec![0_i32, 1, 2, 3, 4, -1].into())], 16)
            .unwrap();

        let info = store.table_info(1).unwrap();
        for fragment in &info.fragments {
            let values = store
                .fetch_fragment(
                    &ColumnVar::new(1, 0, 1, SqlType::Int),
                    fragment,
                    MemoryLevel::Cpu,
                    0,
                )
                .unwrap();
            let shard = fragment.shard_id.unwrap() as i64;
            assert!(values.iter().all(|v| v.rem_euclid(3) == shard));
        }

        let on_device_1 = only_shards_for_device(&info.fragments, 1, 2).unwrap();
        assert_eq!(on_device_1.len(), 1);
        assert_eq!(on_device_1[0].shard_id, Some(1));
    }

    #[test]
    fn concat_keeps_order() {
        let parts: Vec<ColumnBuffer> = vec![vec![1_i16, 2].into(), vec![3_i16].into()];
        let linear = ColumnBuffer::concat(&parts).unwrap();

        assert_eq!(linear, vec![1_i16, 2, 3].into());

        let mixed: Vec<ColumnBuffer> = vec![vec![1_i16].into(), vec![3_i32].into()];
        assert!(ColumnBuffer::concat(&mixed).is_err());
    }

    #[test]
    fn chunk_key_lists_fragments() {
        let store = TableStore::new();
        store.create_table(7, TablePartitioning::Replicated).unwrap();
        store
            .load_columns(7, vec![(3, vec![1_i32, 2, 3].into())], 1)
            .unwrap();
        let info = store.table_info(7).unwrap();
        let key = ChunkKey::for_fragments(&ColumnVar::new(7, 3, 1, SqlType::Int), &info.fragments);

        assert_eq!(key.as_slice(), &[7, 3, 0, 1, 2]);
        assert_eq!(key.table_id(), 7);
    }
}
