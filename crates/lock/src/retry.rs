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

use std::time::Duration;

use crate::context::OperationContext;
use crate::error::{LockError, Result};

const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Retry `operation` until it stops reporting a storage-engine write
/// conflict.
///
/// Each conflict outside a write unit of work increments the operation's
/// write-conflict counter and backs off briefly before re-invoking. Inside a
/// write unit of work the conflict is returned unchanged so the enclosing
/// unit can handle it; any other error propagates immediately.
pub fn write_conflict_retry<T, F>(
    ctx: &OperationContext,
    op_name: &str,
    namespace: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    if ctx.locker().in_write_unit_of_work() {
        return operation();
    }

    let mut attempts = 0u32;
    loop {
        match operation() {
            Err(LockError::WriteConflict) => {
                ctx.op_debug().record_write_conflict();
                log_and_backoff(attempts, op_name, namespace);
                attempts += 1;
            }
            result => return result,
        }
    }
}

/// Quadratic backoff with a cap; the first few retries spin immediately.
fn log_and_backoff(attempt: u32, op_name: &str, namespace: &str) {
    tracing::debug!(attempt, op_name, namespace, "caught write conflict, retrying");
    if attempt < 4 {
        return;
    }
    let millis = u64::from(attempt).saturating_mul(u64::from(attempt));
    std::thread::sleep(Duration::from_millis(millis).min(MAX_BACKOFF));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GlobalWrite;
    use crate::manager::LockManager;
    use std::sync::Arc;

    fn ctx() -> OperationContext {
        OperationContext::new(Arc::new(LockManager::default()))
    }

    #[test]
    fn test_runs_plain_function() {
        let ctx = ctx();
        let value = write_conflict_retry(&ctx, "", "", || Ok(7)).unwrap();
        assert_eq!(value, 7);
        assert_eq!(ctx.op_debug().write_conflicts(), 0);
    }

    #[test]
    fn test_retries_on_write_conflict() {
        let ctx = ctx();
        let value = write_conflict_retry(&ctx, "", "", || {
            if ctx.op_debug().write_conflicts() == 0 {
                return Err(LockError::WriteConflict);
            }
            Ok(100)
        })
        .unwrap();
        assert_eq!(value, 100);
        assert_eq!(ctx.op_debug().write_conflicts(), 1);
    }

    #[test]
    fn test_propagates_other_errors() {
        let ctx = ctx();
        let result: Result<()> =
            write_conflict_retry(&ctx, "", "", || Err(LockError::operation_failed("boom")));
        assert!(matches!(result, Err(LockError::OperationFailed { .. })));
        assert_eq!(ctx.op_debug().write_conflicts(), 0);
    }

    #[test]
    fn test_propagates_write_conflict_inside_wuow() {
        let ctx = ctx();
        let _global = GlobalWrite::new(ctx.locker());
        ctx.locker().begin_write_unit_of_work();

        let result: Result<()> = write_conflict_retry(&ctx, "", "", || Err(LockError::WriteConflict));
        assert!(matches!(result, Err(LockError::WriteConflict)));
        assert_eq!(ctx.op_debug().write_conflicts(), 0);

        ctx.locker().end_write_unit_of_work();
    }
}
