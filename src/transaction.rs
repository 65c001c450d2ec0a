//! Single-shard staged transactions.
//!
//! At most one transaction is open per store. While open, every read and
//! write of the target shard goes to a staging copy; commit renames the copy
//! into place, rollback deletes it. This module tracks the state machine;
//! the file work is done by the store under the target shard's lock.

use crate::error::{Result, StoreError};
use crate::types::{ShardId, Timestamp};
use parking_lot::Mutex;
use std::path::PathBuf;

/// An open transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenTransaction {
    pub shard: ShardId,
    pub staging: PathBuf,
    pub started: Timestamp,
    /// Rows written into the staging file by inserts.
    pub staged_inserts: u64,
    /// Rows removed from the staging file by deletes.
    pub staged_deletes: u64,
}

/// Transaction lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Open(OpenTransaction),
    Committing(OpenTransaction),
    RollingBack(OpenTransaction),
}

impl TransactionState {
    fn current(&self) -> Option<&OpenTransaction> {
        match self {
            TransactionState::Idle => None,
            TransactionState::Open(txn)
            | TransactionState::Committing(txn)
            | TransactionState::RollingBack(txn) => Some(txn),
        }
    }
}

pub struct TransactionManager {
    state: Mutex<TransactionState>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransactionState::Idle),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state.lock().clone()
    }

    pub fn is_idle(&self) -> bool {
        matches!(*self.state.lock(), TransactionState::Idle)
    }

    /// Fail unless no transaction is open.
    pub fn ensure_idle(&self) -> Result<()> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(StoreError::TransactionAlreadyOpen)
        }
    }

    /// `Idle -> Open`.
    pub fn begin(&self, shard: ShardId, staging: PathBuf) -> Result<OpenTransaction> {
        let mut state = self.state.lock();
        if !matches!(*state, TransactionState::Idle) {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        let txn = OpenTransaction {
            shard,
            staging,
            started: Timestamp::now(),
            staged_inserts: 0,
            staged_deletes: 0,
        };
        *state = TransactionState::Open(txn.clone());
        Ok(txn)
    }

    /// `Open -> Committing`.
    pub fn start_commit(&self) -> Result<OpenTransaction> {
        self.transition(TransactionState::Committing)
    }

    /// `Open -> RollingBack`.
    pub fn start_rollback(&self) -> Result<OpenTransaction> {
        self.transition(TransactionState::RollingBack)
    }

    fn transition(
        &self,
        next: impl FnOnce(OpenTransaction) -> TransactionState,
    ) -> Result<OpenTransaction> {
        let mut state = self.state.lock();
        match &*state {
            TransactionState::Open(txn) => {
                let txn = txn.clone();
                *state = next(txn.clone());
                Ok(txn)
            }
            _ => Err(StoreError::NoOpenTransaction),
        }
    }

    /// Snapshot of the current transaction including staged counts.
    pub fn current(&self) -> Option<OpenTransaction> {
        self.state.lock().current().cloned()
    }

    /// Count rows staged into `shard`, if it is the transaction target.
    ///
    /// Called with the shard lock held.
    pub fn record_staged(&self, shard: ShardId, inserts: u64, deletes: u64) {
        let mut state = self.state.lock();
        let txn = match &mut *state {
            TransactionState::Idle => return,
            TransactionState::Open(txn)
            | TransactionState::Committing(txn)
            | TransactionState::RollingBack(txn) => txn,
        };
        if txn.shard == shard {
            txn.staged_inserts += inserts;
            txn.staged_deletes += deletes;
        }
    }

    /// Back to `Idle` after a completed commit or rollback, or an aborted begin.
    pub fn finish(&self) {
        *self.state.lock() = TransactionState::Idle;
    }

    /// Back to `Open` after a failed commit or rollback.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if let TransactionState::Committing(txn) | TransactionState::RollingBack(txn) = &*state {
            *state = TransactionState::Open(txn.clone());
        }
    }
}
