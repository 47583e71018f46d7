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

mod fixture;

use datagen::relation::{KeyAttribute, UniformRelation, ZipfRelation};
use fixture::*;
use itertools::Itertools;
use join_hashtable::error::{ErrorKind, FailureClass};
use join_hashtable::expr::{ColumnVar, Expr, JoinOp, SqlType, BinOper};
use join_hashtable::join::{HashTableConfig, HashType, JoinHashTable, JoinHashTableBuilder};
use join_hashtable::range::{ExpressionRange, IntRange, ValueRangeProvider};
use join_hashtable::storage::{
    ColumnBuffer, InputTableInfo, TablePartitioning, TableStore,
};
use device_mem::runtime::memory::MemoryLevel;
use once_cell::sync::Lazy;
use rand::{thread_rng, Rng};
use std::collections::HashSet;
use std::error::Error;
use std::result::Result;
use std::sync::Arc;

static UNIQUE_KEYS: Lazy<Vec<i32>> = Lazy::new(|| {
    let mut keys = vec![0; 10_000];
    UniformRelation::gen_primary_key(&mut keys, -500, None).unwrap();
    keys
});

static SKEWED_KEYS: Lazy<Vec<i64>> = Lazy::new(|| {
    let mut keys = vec![0; 20_000];
    ZipfRelation::gen_attr(&mut keys, 1_000, 300, 1.2).unwrap();
    UniformRelation::inject_nulls(&mut keys, 5);
    keys
});

fn build_on_cpu(
    store: &Arc<TableStore>,
    op: JoinOp,
    sql_type: SqlType,
) -> join_hashtable::error::Result<JoinHashTable> {
    JoinHashTableBuilder::default()
        .qual_bin_oper(qual(op, sql_type))
        .query_infos(query_infos(store).unwrap())
        .column_fetcher(store.clone())
        .range_provider(store.clone())
        .build()
}

fn expect_error<T: std::fmt::Debug>(
    result: join_hashtable::error::Result<T>,
    check: impl Fn(&ErrorKind) -> bool,
) -> join_hashtable::error::Error {
    match result {
        Err(e) if check(e.kind()) => e,
        other => panic!("Unexpected result: {:?}", other),
    }
}

/// Checks that every row of the inner column is found by probing its key.
fn verify_round_trip(table: &JoinHashTable, rows: &[i64], null: i64, op: JoinOp) {
    for (row, &key) in rows.iter().enumerate() {
        let matches = table.probe(0, key);
        if key == null && op == JoinOp::Eq {
            assert!(matches.is_empty());
        } else {
            assert_eq!(
                matches.iter().filter(|&&m| m == row as i32).count(),
                1,
                "Row {} with key {} not found exactly once",
                row,
                key
            );
            assert!(matches.iter().all(|&m| rows[m as usize] == key));
        }
    }
}

macro_rules! round_trip_tests {
    ($($name:ident: $keys:expr, $type:ty, $sql_type:expr, $op:expr, $fragment_size:expr, $hash_type:expr,)*) => {
        $(
            #[test]
            fn $name() -> Result<(), Box<dyn Error>> {
                let keys: Vec<$type> = $keys.iter().map(|&k| k as $type).collect();
                let store = store_with_inner(
                    keys.into(),
                    TablePartitioning::Replicated,
                    $fragment_size,
                )?;
                let table = build_on_cpu(&store, $op, $sql_type)?;
                let rows = rows_of_device(&store, $sql_type, None)?;

                assert_eq!(table.hash_type(), $hash_type);
                verify_round_trip(&table, &rows, <$type>::null_key() as i64, $op);
                Ok(())
            }
        )*
    };
}

round_trip_tests! {
    unique_i32_single_fragment: UNIQUE_KEYS, i32, SqlType::Int, JoinOp::Eq, 1 << 20, HashType::OneToOne,
    unique_i32_many_fragments: UNIQUE_KEYS, i32, SqlType::Int, JoinOp::Eq, 999, HashType::OneToOne,
    unique_i64_date: UNIQUE_KEYS, i64, SqlType::Date, JoinOp::Eq, 4096, HashType::OneToOne,
    unique_i16_bw_eq: UNIQUE_KEYS, i16, SqlType::SmallInt, JoinOp::BwEq, 3000, HashType::OneToOne,
    skewed_i64_eq: SKEWED_KEYS, i64, SqlType::BigInt, JoinOp::Eq, 5000, HashType::OneToMany,
    skewed_i64_bw_eq: SKEWED_KEYS, i64, SqlType::BigInt, JoinOp::BwEq, 5000, HashType::OneToMany,
}

#[test]
fn collision_falls_back_to_one_to_many() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(vec![5_i32, 7, 5, 9].into(), TablePartitioning::Replicated, 16)?;
    let table = build_on_cpu(&store, JoinOp::Eq, SqlType::Int)?;

    assert_eq!(table.hash_type(), HashType::OneToMany);
    assert_eq!(*table.col_range(), IntRange::new(5, 9, false));

    let layout = table.table(0).unwrap().host_buffer().layout();
    assert_eq!(layout.counts().unwrap(), &[2, 0, 1, 0, 1]);
    assert_eq!(layout.offsets().unwrap(), &[0, 2, 2, 3, 3]);
    assert_eq!(layout.payload().unwrap(), &[0, 2, 1, 3]);

    assert_eq!(table.probe(0, 5), &[0, 2]);
    assert_eq!(table.probe(0, 6), &[] as &[i32]);
    Ok(())
}

#[test]
fn one_to_many_prefix_sums_are_complete() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(
        SKEWED_KEYS.clone().into(),
        TablePartitioning::Replicated,
        7_000,
    )?;
    let table = build_on_cpu(&store, JoinOp::Eq, SqlType::BigInt)?;
    let layout = table.table(0).unwrap().host_buffer().layout();

    let offsets = layout.offsets().unwrap();
    let counts = layout.counts().unwrap();
    assert!(offsets
        .iter()
        .zip(counts)
        .tuple_windows()
        .all(|((offset, count), (next, _))| *next == offset + count));

    let non_null = SKEWED_KEYS.iter().filter(|&&k| k != i64::null_key()).count();
    assert_eq!(layout.payload().unwrap().len(), non_null);
    assert_eq!(counts.iter().map(|&c| c as usize).sum::<usize>(), non_null);
    Ok(())
}

#[test]
fn matches_follow_scan_order() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(
        SKEWED_KEYS.clone().into(),
        TablePartitioning::Replicated,
        1_024,
    )?;
    let table = build_on_cpu(&store, JoinOp::Eq, SqlType::BigInt)?;

    for key in 1_000..1_300 {
        let matches = table.probe(0, key);
        assert!(matches.iter().tuple_windows().all(|(a, b)| a < b));
    }
    Ok(())
}

#[test]
fn out_of_range_probes_miss() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(
        UNIQUE_KEYS.clone().into(),
        TablePartitioning::Replicated,
        4_096,
    )?;
    let table = build_on_cpu(&store, JoinOp::Eq, SqlType::Int)?;
    let range = *table.col_range();
    let mut rng = thread_rng();

    assert_eq!(range, IntRange::new(-500, 9_499, false));
    for _ in 0..1_000 {
        let below = rng.gen_range(i64::MIN + 1, range.min);
        let above = rng.gen_range(range.max + 1, i64::MAX);
        assert!(table.probe(0, below).is_empty());
        assert!(table.probe(0, above).is_empty());
    }
    assert!(table.probe(0, i64::MIN).is_empty());
    assert!(table.probe(0, i32::MIN as i64).is_empty());
    Ok(())
}

#[test]
fn nulls_only_match_with_bitwise_equality() -> Result<(), Box<dyn Error>> {
    let keys = vec![3_i32, i32::MIN, 4, i32::MIN];
    let store = store_with_inner(keys.into(), TablePartitioning::Replicated, 16)?;

    let eq = build_on_cpu(&store, JoinOp::Eq, SqlType::Int)?;
    assert_eq!(eq.hash_type(), HashType::OneToOne);
    assert_eq!(eq.entry_count(), 2);
    assert!(eq.probe(0, i32::MIN as i64).is_empty());
    assert!(eq.codegen_contract(0)?.skips_null_keys());

    let bw_eq = build_on_cpu(&store, JoinOp::BwEq, SqlType::Int)?;
    assert_eq!(bw_eq.hash_type(), HashType::OneToMany);
    assert_eq!(bw_eq.entry_count(), 3);
    assert_eq!(bw_eq.probe(0, i32::MIN as i64), &[1, 3]);
    assert!(bw_eq.probe(0, 5).is_empty());

    let contract = bw_eq.codegen_contract(0)?;
    assert_eq!(contract.translated_null, Some(5));
    assert!(contract.has_nulls);
    Ok(())
}

#[test]
fn empty_inner_table() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(Vec::<i32>::new().into(), TablePartitioning::Replicated, 16)?;

    let eq = build_on_cpu(&store, JoinOp::Eq, SqlType::Int)?;
    assert_eq!(eq.entry_count(), 0);
    assert_eq!(eq.join_hash_buffer(MemoryLevel::Cpu, 0), 0);
    assert!(eq.probe(0, 0).is_empty());

    let bw_eq = build_on_cpu(&store, JoinOp::BwEq, SqlType::Int)?;
    assert_eq!(bw_eq.entry_count(), 1);
    assert!(bw_eq.probe(0, i32::MIN as i64).is_empty());
    Ok(())
}

#[test]
fn forced_one_to_many_layout() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(
        UNIQUE_KEYS.clone().into(),
        TablePartitioning::Replicated,
        4_096,
    )?;
    let table = JoinHashTableBuilder::default()
        .qual_bin_oper(qual(JoinOp::Eq, SqlType::Int))
        .query_infos(query_infos(&store)?)
        .column_fetcher(store.clone())
        .range_provider(store.clone())
        .config(HashTableConfig {
            force_one_to_many: true,
            ..HashTableConfig::default()
        })
        .build()?;

    assert_eq!(table.hash_type(), HashType::OneToMany);
    verify_round_trip(&table, &rows_of_device(&store, SqlType::Int, None)?, i32::MIN as i64, JoinOp::Eq);
    Ok(())
}

#[test]
fn virtual_column_is_infeasible() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(vec![1_i32, 2].into(), TablePartitioning::Replicated, 16)?;
    let qual = BinOper::new(
        JoinOp::Eq,
        Expr::Column(outer_col(SqlType::Int)),
        Expr::Column(inner_col(SqlType::Int).virtual_column()),
    );
    let result = JoinHashTableBuilder::default()
        .qual_bin_oper(qual)
        .query_infos(query_infos(&store)?)
        .column_fetcher(store.clone())
        .range_provider(store.clone())
        .build();

    let error = expect_error(result, |k| matches!(k, ErrorKind::VirtualColumnJoin(_)));
    assert_eq!(error.class(), FailureClass::Infeasible);
    assert!(error.allows_fallback());
    Ok(())
}

#[test]
fn too_many_fragments() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(vec![1_i32, 2, 3].into(), TablePartitioning::Replicated, 1)?;
    let result = JoinHashTableBuilder::default()
        .qual_bin_oper(qual(JoinOp::Eq, SqlType::Int))
        .query_infos(query_infos(&store)?)
        .column_fetcher(store.clone())
        .range_provider(store.clone())
        .config(HashTableConfig {
            max_linearized_fragments: 2,
            ..HashTableConfig::default()
        })
        .build();

    expect_error(result, |k| matches!(k, ErrorKind::TooManyFragments(INNER_TABLE, 3)));
    Ok(())
}

#[test]
fn domain_too_large() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(
        vec![0_i64, 1 << 40].into(),
        TablePartitioning::Replicated,
        16,
    )?;
    let error = expect_error(build_on_cpu(&store, JoinOp::Eq, SqlType::BigInt), |k| {
        matches!(k, ErrorKind::TooManyHashEntries(_))
    });

    assert_eq!(error.class(), FailureClass::Capacity);
    Ok(())
}

#[test]
fn bitwise_equality_at_maximum_key() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(
        vec![i64::MAX - 1, i64::MAX].into(),
        TablePartitioning::Replicated,
        16,
    )?;

    assert!(build_on_cpu(&store, JoinOp::Eq, SqlType::BigInt).is_ok());
    expect_error(build_on_cpu(&store, JoinOp::BwEq, SqlType::BigInt), |k| {
        matches!(k, ErrorKind::ColumnRangeInvalid(_))
    });
    Ok(())
}

#[test]
fn unsupported_conditions() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(vec![1_i32, 2].into(), TablePartitioning::Replicated, 16)?;

    expect_error(build_on_cpu(&store, JoinOp::Le, SqlType::Int), |k| {
        matches!(k, ErrorKind::UnsupportedJoin(_))
    });
    expect_error(build_on_cpu(&store, JoinOp::Eq, SqlType::Double), |k| {
        matches!(k, ErrorKind::UnsupportedJoin(_))
    });
    Ok(())
}

/// A range provider that reports the same range for every column.
struct FixedRangeProvider(ExpressionRange);

impl ValueRangeProvider for FixedRangeProvider {
    fn column_range(
        &self,
        _col: &ColumnVar,
        _query_infos: &[InputTableInfo],
        _skip_tables: &HashSet<i32>,
    ) -> ExpressionRange {
        self.0
    }
}

#[test]
fn stale_range_metadata() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(vec![1_i32, 20, 3].into(), TablePartitioning::Replicated, 16)?;
    let builder = |provider: Arc<dyn ValueRangeProvider>| {
        JoinHashTableBuilder::default()
            .qual_bin_oper(qual(JoinOp::Eq, SqlType::Int))
            .query_infos(query_infos(&store).unwrap())
            .column_fetcher(store.clone())
            .range_provider(provider)
            .build()
    };

    let error = expect_error(
        builder(Arc::new(FixedRangeProvider(ExpressionRange::Integer(
            IntRange::new(1, 10, false),
        )))),
        |k| matches!(k, ErrorKind::KeyOutOfRange(20, 1, 10)),
    );
    assert_eq!(error.class(), FailureClass::Infeasible);

    expect_error(builder(Arc::new(FixedRangeProvider(ExpressionRange::Invalid))), |k| {
        matches!(k, ErrorKind::ColumnRangeInvalid(_))
    });

    let floating_point = ExpressionRange::FloatingPoint {
        min: 1.0,
        max: 20.0,
        has_nulls: false,
    };
    let error = expect_error(builder(Arc::new(FixedRangeProvider(floating_point))), |k| {
        matches!(k, ErrorKind::ColumnRangeInvalid(_))
    });
    assert!(error.allows_fallback());
    Ok(())
}

#[test]
fn derived_outer_expression() -> Result<(), Box<dyn Error>> {
    let store = store_with_inner(vec![10_i32, 11, 12].into(), TablePartitioning::Replicated, 16)?;
    let qual = BinOper::new(
        JoinOp::Eq,
        Expr::Column(inner_col(SqlType::Int)),
        Expr::Derived {
            sql_type: SqlType::Int,
            rte_idx: 0,
            repr: "outer.key + 1".to_string(),
        },
    );
    let table = JoinHashTableBuilder::default()
        .qual_bin_oper(qual)
        .query_infos(query_infos(&store)?)
        .column_fetcher(store.clone())
        .range_provider(store.clone())
        .build()?;

    assert_eq!(table.inner_table_id(), INNER_TABLE);
    assert_eq!(table.probe(0, 12), &[2]);
    Ok(())
}

#[test]
fn column_buffer_from_store_matches_input() -> Result<(), Box<dyn Error>> {
    let keys: Vec<i16> = vec![4, -3, i16::MIN, 7];
    let store = store_with_inner(keys.clone().into(), TablePartitioning::Replicated, 3)?;
    let rows = rows_of_device(&store, SqlType::SmallInt, None)?;

    assert_eq!(rows, keys.iter().map(|&k| k as i64).collect::<Vec<_>>());
    assert_eq!(
        ColumnBuffer::from(keys).value_range(),
        IntRange::new(-3, 7, true)
    );
    Ok(())
}
