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

//! Generators for join key columns.
//!
//! Key columns are generated as primary keys (unique, contiguous), as
//! foreign keys sampled from a primary key column, or as attributes with
//! duplicates following a uniform or a Zipf distribution. Any generated
//! column can contain `NULL` keys, which are represented by the key type's
//! inline null value.

pub mod error;
pub mod relation;
