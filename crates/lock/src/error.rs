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

use thiserror::Error;

/// Errors surfaced to callers of the lock subsystem.
///
/// Lock acquisition outcomes (granted, waiting, timed out) are return codes,
/// never errors. These errors model collaborator failures that flow through
/// the retry harness: a write conflict from the storage engine is the only
/// retryable kind, and only outside a write unit of work.
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// Storage-engine write conflict; retried by `write_conflict_retry`.
    #[error("write conflict")]
    WriteConflict,

    /// Operation failure reported by a collaborator; passes through unchanged.
    #[error("operation failed: {message}")]
    OperationFailed { message: String },
}

impl LockError {
    /// Create an operation failure.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed { message: message.into() }
    }

    /// Whether this error is a storage-engine write conflict.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict)
    }
}

/// Result type for operations run under the lock subsystem.
pub type Result<T> = std::result::Result<T, LockError>;
