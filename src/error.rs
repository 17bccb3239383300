use crate::transaction::TransactionId;
use thiserror::Error;

pub type BurrowDBResult<T, E = BurrowDBError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum BurrowDBError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Transaction {txn_id} aborted: {reason}")]
    TransactionAbort {
        txn_id: TransactionId,
        reason: AbortReason,
    },

    #[error("Unwind")]
    Unwind,
}

/// Reasons the lock manager moves a transaction to `Aborted` before
/// surfacing an error to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedUnlockButNoLockHeld,
    TableUnlockedBeforeRows,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AbortReason::LockOnShrinking => "lock requested while shrinking",
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under READ_UNCOMMITTED"
            }
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "requested upgrade is not permitted",
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock without a granted lock",
            AbortReason::TableUnlockedBeforeRows => "table unlocked while row locks remain",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableLockNotPresent => "row lock requested without a table lock",
        };
        write!(f, "{}", msg)
    }
}
