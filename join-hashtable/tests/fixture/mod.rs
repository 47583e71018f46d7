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

#![allow(dead_code)]

use join_hashtable::expr::{BinOper, ColumnVar, Expr, JoinOp, SqlType};
use join_hashtable::storage::{
    only_shards_for_device, ColumnBuffer, ColumnFetcher, InputTableInfo, TablePartitioning,
    TableStore,
};
use device_mem::runtime::memory::MemoryLevel;
use std::error::Error;
use std::result::Result;
use std::sync::Arc;

pub const OUTER_TABLE: i32 = 1;
pub const INNER_TABLE: i32 = 2;
pub const KEY_COLUMN: i32 = 0;

pub fn inner_col(sql_type: SqlType) -> ColumnVar {
    ColumnVar::new(INNER_TABLE, KEY_COLUMN, 1, sql_type).with_name("inner.key")
}

pub fn outer_col(sql_type: SqlType) -> ColumnVar {
    ColumnVar::new(OUTER_TABLE, KEY_COLUMN, 0, sql_type).with_name("outer.key")
}

pub fn qual(op: JoinOp, sql_type: SqlType) -> BinOper {
    BinOper::new(
        op,
        Expr::Column(outer_col(sql_type)),
        Expr::Column(inner_col(sql_type)),
    )
}

/// Loads `inner` into the inner table and a copy of it into the outer table.
pub fn store_with_inner(
    inner: ColumnBuffer,
    partitioning: TablePartitioning,
    fragment_size: usize,
) -> Result<Arc<TableStore>, Box<dyn Error>> {
    let store = Arc::new(TableStore::new());
    for &table_id in &[OUTER_TABLE, INNER_TABLE] {
        store.create_table(table_id, partitioning)?;
        store.load_columns(table_id, vec![(KEY_COLUMN, inner.clone())], fragment_size)?;
    }
    Ok(store)
}

pub fn query_infos(store: &TableStore) -> Result<Vec<InputTableInfo>, Box<dyn Error>> {
    Ok(vec![
        store.table_info(OUTER_TABLE)?,
        store.table_info(INNER_TABLE)?,
    ])
}

/// The inner key values in the order in which a device's hash table numbers
/// the rows.
pub fn rows_of_device(
    store: &TableStore,
    sql_type: SqlType,
    sharded_devices: Option<(u32, u32)>,
) -> Result<Vec<i64>, Box<dyn Error>> {
    let info = store.table_info(INNER_TABLE)?;
    let fragments = match sharded_devices {
        Some((device_id, device_count)) => {
            only_shards_for_device(&info.fragments, device_id, device_count)?
        }
        None => info.fragments,
    };

    let mut rows = Vec::new();
    for fragment in &fragments {
        let chunk = store.fetch_fragment(&inner_col(sql_type), fragment, MemoryLevel::Cpu, 0)?;
        rows.extend(chunk.iter());
    }
    Ok(rows)
}
