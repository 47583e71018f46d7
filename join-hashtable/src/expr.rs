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

//! Join conditions and their normalization into join keys.

use crate::error::{ErrorKind, Result};
use std::fmt;

/// SQL types of join key columns and expressions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SqlType {
    Boolean,
    SmallInt,
    Int,
    BigInt,
    /// Days since epoch, stored as a 64-bit integer
    Date,
    /// Dictionary-encoded text, stored as 32-bit dictionary ids
    DictText { dict_id: i32 },
    /// Text without dictionary encoding
    Text,
    Float,
    Double,
}

impl SqlType {
    /// Returns true if values of the type are stored as integers that can be
    /// used as hash join keys.
    pub fn is_integer_like(&self) -> bool {
        match self {
            SqlType::SmallInt
            | SqlType::Int
            | SqlType::BigInt
            | SqlType::Date
            | SqlType::DictText { .. } => true,
            _ => false,
        }
    }

    /// The inline `NULL` value of integer-like types.
    pub fn null_sentinel(&self) -> Option<i64> {
        match self {
            SqlType::SmallInt => Some(i16::MIN as i64),
            SqlType::Int | SqlType::DictText { .. } => Some(i32::MIN as i64),
            SqlType::BigInt | SqlType::Date => Some(i64::MIN),
            _ => None,
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlType::Boolean => write!(f, "BOOLEAN"),
            SqlType::SmallInt => write!(f, "SMALLINT"),
            SqlType::Int => write!(f, "INTEGER"),
            SqlType::BigInt => write!(f, "BIGINT"),
            SqlType::Date => write!(f, "DATE"),
            SqlType::DictText { dict_id } => write!(f, "TEXT ENCODING DICT({})", dict_id),
            SqlType::Text => write!(f, "TEXT ENCODING NONE"),
            SqlType::Float => write!(f, "FLOAT"),
            SqlType::Double => write!(f, "DOUBLE"),
        }
    }
}

/// A reference to a column of an input table.
///
/// Temporary tables, e.g. intermediate results, have negative table ids.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ColumnVar {
    pub table_id: i32,
    pub column_id: i32,
    /// Nesting level of the table in the query's range table
    pub rte_idx: usize,
    pub sql_type: SqlType,
    pub name: String,
    /// Virtual columns, e.g. the row id, are not materialized in storage
    pub is_virtual: bool,
}

impl ColumnVar {
    pub fn new(table_id: i32, column_id: i32, rte_idx: usize, sql_type: SqlType) -> Self {
        Self {
            table_id,
            column_id,
            rte_idx,
            sql_type,
            name: format!("t{}.c{}", table_id, column_id),
            is_virtual: false,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn virtual_column(mut self) -> Self {
        self.is_virtual = true;
        self
    }
}

/// An operand of a join condition.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Expr {
    Column(ColumnVar),
    /// An expression evaluated by generated code, e.g. `t0.c1 + 1`
    Derived {
        sql_type: SqlType,
        rte_idx: usize,
        repr: String,
    },
}

impl Expr {
    pub fn sql_type(&self) -> SqlType {
        match self {
            Expr::Column(col) => col.sql_type,
            Expr::Derived { sql_type, .. } => *sql_type,
        }
    }

    pub fn rte_idx(&self) -> usize {
        match self {
            Expr::Column(col) => col.rte_idx,
            Expr::Derived { rte_idx, .. } => *rte_idx,
        }
    }

    pub fn as_column(&self) -> Option<&ColumnVar> {
        match self {
            Expr::Column(col) => Some(col),
            Expr::Derived { .. } => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(col) => write!(f, "{}", col.name),
            Expr::Derived { repr, .. } => write!(f, "{}", repr),
        }
    }
}

/// Comparison operators of join conditions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum JoinOp {
    /// `=`, never matches `NULL`
    Eq,
    /// `IS NOT DISTINCT FROM`, matches `NULL` with `NULL`
    BwEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl JoinOp {
    pub fn is_equi(&self) -> bool {
        match self {
            JoinOp::Eq | JoinOp::BwEq => true,
            _ => false,
        }
    }

    pub fn is_bw_eq(&self) -> bool {
        *self == JoinOp::BwEq
    }
}

impl fmt::Display for JoinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinOp::Eq => "=",
            JoinOp::BwEq => "IS NOT DISTINCT FROM",
            JoinOp::Ne => "<>",
            JoinOp::Lt => "<",
            JoinOp::Le => "<=",
            JoinOp::Gt => ">",
            JoinOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

/// A binary join condition, e.g. `t0.a = t1.b`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BinOper {
    pub op: JoinOp,
    pub lhs: Expr,
    pub rhs: Expr,
}

impl BinOper {
    pub fn new(op: JoinOp, lhs: Expr, rhs: Expr) -> Self {
        Self { op, lhs, rhs }
    }
}

impl fmt::Display for BinOper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.op, self.rhs)
    }
}

/// A join condition with the inner column first.
///
/// The hash table is built on the inner column and probed with the outer
/// expression.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct JoinKey {
    pub inner: ColumnVar,
    pub outer: Expr,
    pub op: JoinOp,
}

/// Orders the operands of `qual` such that the inner column comes first.
///
/// Both operands must have the same integer-like type. The inner side must
/// be a column. If both sides are columns, the column with the larger range
/// table index is the inner side.
pub fn normalize_column_pair(qual: &BinOper) -> Result<JoinKey> {
    if !qual.op.is_equi() {
        Err(ErrorKind::UnsupportedJoin(format!(
            "Operator {} is not an equality",
            qual.op
        )))?;
    }

    let lhs_type = qual.lhs.sql_type();
    let rhs_type = qual.rhs.sql_type();
    if lhs_type != rhs_type {
        Err(ErrorKind::UnsupportedJoin(format!(
            "Equijoin types must be identical, found: {}, {}",
            lhs_type, rhs_type
        )))?;
    }
    if !lhs_type.is_integer_like() {
        Err(ErrorKind::UnsupportedJoin(format!(
            "Cannot apply hash join to inner column type {}",
            lhs_type
        )))?;
    }

    let (inner, outer) = match (&qual.lhs, &qual.rhs) {
        (Expr::Column(lhs), Expr::Column(rhs)) => {
            if lhs.rte_idx > rhs.rte_idx {
                (lhs, &qual.rhs)
            } else {
                (rhs, &qual.lhs)
            }
        }
        (Expr::Derived { .. }, Expr::Column(rhs)) => (rhs, &qual.lhs),
        (Expr::Column(lhs), Expr::Derived { .. }) => (lhs, &qual.rhs),
        (Expr::Derived { .. }, Expr::Derived { .. }) => Err(ErrorKind::UnsupportedJoin(
            "Cannot use hash join for given expression".to_string(),
        ))?,
    };

    if inner.rte_idx == outer.rte_idx() {
        Err(ErrorKind::UnsupportedJoin(format!(
            "{} doesn't join two different relations",
            qual
        )))?;
    }

    Ok(JoinKey {
        inner: inner.clone(),
        outer: outer.clone(),
        op: qual.op,
    })
}
