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

//! Join hash table construction.

pub mod cache;
pub mod cpu_build;
pub mod device_build;
pub mod hash_layout;
pub mod join_hash_table;
pub mod linearize;

pub use cache::{CacheConfig, CacheStats, HashTableCache, HashTableCacheKey};
pub use device_build::DeviceHashTable;
pub use hash_layout::{HashLayout, HashTableBuffer, HashType, KeyMapping, ShardLayout};
pub use join_hash_table::{HashJoinContract, HashTableConfig, JoinHashTable, JoinHashTableBuilder};
