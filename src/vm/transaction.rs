use crate::error::Error;
use crate::id::Xid;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

/// Runtime state of a transaction that has not been committed or aborted by
/// its owner yet.
pub(crate) struct Transaction {
    pub(crate) xid: Xid,
    pub(crate) level: IsolationLevel,
    snapshot: HashSet<Xid>,
    error: Mutex<Option<Error>>,
    auto_aborted: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(xid: Xid, level: IsolationLevel, active: impl Iterator<Item = Xid>) -> Self {
        let snapshot = match level {
            IsolationLevel::ReadCommitted => HashSet::default(),
            IsolationLevel::RepeatableRead => active.filter(|xid| !xid.is_super()).collect(),
        };
        Self {
            xid,
            level,
            snapshot,
            error: Mutex::new(None),
            auto_aborted: AtomicBool::new(false),
        }
    }

    /// Whether `xid` was still running when this transaction began.
    pub(crate) fn in_snapshot(&self, xid: Xid) -> bool {
        !xid.is_super() && self.snapshot.contains(&xid)
    }

    pub(crate) fn error(&self) -> Option<Error> {
        *self.error.lock()
    }

    pub(crate) fn set_error(&self, err: Error) {
        self.error.lock().get_or_insert(err);
    }

    /// Fails with the stored error if the transaction already failed.
    pub(crate) fn check(&self) -> anyhow::Result<()> {
        match self.error() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub(crate) fn is_auto_aborted(&self) -> bool {
        self.auto_aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_auto_aborted(&self) {
        self.auto_aborted.store(true, Ordering::SeqCst);
    }
}
