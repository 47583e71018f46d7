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

//! # Join Hash Tables
//!
//! `join-hashtable` builds the hash tables of equi-joins whose keys lie in a
//! bounded integer domain. Keys are hashed with the identity function,
//! shifted by the smallest key of the domain, so that a lookup is a single
//! array access.
//!
//! A table is built once per device from the inner column of the join, and
//! is then probed by generated code through its
//! [`HashJoinContract`](join::HashJoinContract). Two layouts exist:
//!
//! - One-to-one: one row index per key. Used if all keys are unique.
//! - One-to-many: a compressed sparse layout with all matching rows per
//!   key. Used if any key occurs twice, or if the query needs all matches.
//!
//! The one-to-one layout is tried first. On the first collision, the tables
//! of all devices are rebuilt with the one-to-many layout.
//!
//! Built tables are kept in a [`HashTableCache`](join::HashTableCache) in
//! host memory and reused by later joins over the same data.
//!
//! Failures are classified by [`FailureClass`](error::FailureClass). Except
//! for internal errors, the query can fall back to a join strategy that does
//! not use a hash table.

pub mod error;
pub mod expr;
pub mod join;
pub mod range;
pub mod storage;
