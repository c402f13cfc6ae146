// Copyright 2025 FerroDB Team
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

/// Default bucket count for the resource hash table (power of 2).
pub const DEFAULT_BUCKET_COUNT: usize = 128;

/// Default partition count for intent-only lock heads (power of 2).
pub const DEFAULT_PARTITION_COUNT: usize = 8;

/// Configuration for the lock manager's internal sharding.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Number of buckets in the resource hash table. Mutation of a lock head
    /// is serialized by its bucket mutex.
    pub bucket_count: usize,
    /// Number of partitions used for hot, intent-only resources.
    pub partition_count: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            partition_count: DEFAULT_PARTITION_COUNT,
        }
    }
}

impl LockManagerConfig {
    pub fn with_bucket_count(mut self, count: usize) -> Self {
        self.bucket_count = count.next_power_of_two().max(1);
        self
    }

    pub fn with_partition_count(mut self, count: usize) -> Self {
        self.partition_count = count.next_power_of_two().max(1);
        self
    }
}

/// Per-locker capabilities, supplied by the embedding engine instead of
/// process-wide flags so the core stays testable without global state.
#[derive(Debug, Clone, Copy)]
pub struct LockerOptions {
    /// Whether the storage engine supports document-level locking. When it
    /// does not, collection locks requested at an intent mode are promoted
    /// to the corresponding non-intent mode (IS becomes S, IX becomes X).
    pub supports_document_locking: bool,
    /// Whether global acquisitions must be coupled with the journal-flush
    /// lock, as required by the legacy journaled engine.
    pub couples_journal_flush: bool,
}

impl Default for LockerOptions {
    fn default() -> Self {
        Self {
            supports_document_locking: true,
            couples_journal_flush: false,
        }
    }
}

impl LockerOptions {
    /// Options for the legacy journaled engine: no document-level locking,
    /// journal-flush coupling on.
    pub fn legacy_journaled() -> Self {
        Self {
            supports_document_locking: false,
            couples_journal_flush: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LockManagerConfig::default();
        assert_eq!(config.bucket_count, DEFAULT_BUCKET_COUNT);
        assert_eq!(config.partition_count, DEFAULT_PARTITION_COUNT);

        let options = LockerOptions::default();
        assert!(options.supports_document_locking);
        assert!(!options.couples_journal_flush);
    }

    #[test]
    fn test_counts_rounded_to_power_of_two() {
        let config = LockManagerConfig::default().with_bucket_count(100).with_partition_count(3);
        assert_eq!(config.bucket_count, 128);
        assert_eq!(config.partition_count, 4);
    }
}
