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

use crate::range::MAX_HASH_ENTRIES;
use error_chain::error_chain;

error_chain! {
    errors {
        UnsupportedJoin(msg: String) {
            description("Hash join is not applicable")
            display("Hash join is not applicable: {}", msg)
        }
        ColumnRangeInvalid(msg: String) {
            description("Invalid column range for hash join")
            display("Invalid column range for hash join: {}", msg)
        }
        VirtualColumnJoin(column: String) {
            description("Cannot join on a virtual column")
            display("Cannot join on virtual column {}", column)
        }
        TooManyFragments(table_id: i32, fragments: usize) {
            description("Too many fragments to linearize")
            display("Cannot linearize {} fragments of table {}", fragments, table_id)
        }
        ReplicationConstraint(msg: String) {
            description("Replication constraint violated")
            display("Hash join replication constraint violated: {}", msg)
        }
        FailedToFetchColumn(msg: String) {
            description("Failed to fetch column")
            display("Failed to fetch column: {}", msg)
        }
        KeyOutOfRange(key: i64, min: i64, max: i64) {
            description("Join key outside of the column range")
            display("Join key {} lies outside of the column range [{}, {}]", key, min, max)
        }
        TooManyHashEntries(entries: u64) {
            description("Too many hash entries")
            display(
                "Hash tables with more than {} entries not supported, requested {}",
                MAX_HASH_ENTRIES,
                entries
            )
        }
        InvalidArgument(msg: String) {
            description("Invalid argument error")
            display("Aborted with: {}", msg)
        }
        IntegerOverflow(msg: String) {
            description("Integer overflow error")
            display("Aborted with: {}", msg)
        }
        LogicError(msg: String) {
            description("Logic error")
            display("Aborted with: {}", msg)
        }
    }

    foreign_links {
        DeviceMem(device_mem::error::Error);
    }
}

/// Classification of a failed hash table construction.
///
/// Determines how the query should react. Except for internal errors, the
/// query falls back to a join strategy that does not use a hash table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// The join can't be executed with a hash table at all
    Infeasible,
    /// A device ran out of memory or rejected a transfer
    Resource,
    /// The key domain exceeds the addressable row-index range
    Capacity,
    /// A bug or a misuse of the API
    Internal,
}

impl Error {
    pub fn class(&self) -> FailureClass {
        match self.kind() {
            ErrorKind::UnsupportedJoin(_)
            | ErrorKind::ColumnRangeInvalid(_)
            | ErrorKind::VirtualColumnJoin(_)
            | ErrorKind::TooManyFragments(..)
            | ErrorKind::ReplicationConstraint(_)
            | ErrorKind::FailedToFetchColumn(_)
            | ErrorKind::KeyOutOfRange(..) => FailureClass::Infeasible,
            ErrorKind::TooManyHashEntries(_) => FailureClass::Capacity,
            ErrorKind::DeviceMem(_) => FailureClass::Resource,
            _ => FailureClass::Internal,
        }
    }

    /// Returns true if the query may continue with a non-hash join.
    pub fn allows_fallback(&self) -> bool {
        self.class() != FailureClass::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, FailureClass};

    #[test]
    fn device_errors_are_resource_failures() {
        let device_error: device_mem::error::Error =
            device_mem::error::ErrorKind::OutOfMemory(2, 1024).into();
        let error: Error = device_error.into();

        assert_eq!(error.class(), FailureClass::Resource);
        assert!(error.allows_fallback());
    }

    #[test]
    fn internal_errors_prevent_fallback() {
        let error: Error = ErrorKind::LogicError("broken".to_string()).into();

        assert_eq!(error.class(), FailureClass::Internal);
        assert!(!error.allows_fallback());
    }

    #[test]
    fn capacity_is_not_infeasible() {
        let error: Error = ErrorKind::TooManyHashEntries(1 << 40).into();

        assert_eq!(error.class(), FailureClass::Capacity);
    }
}
