use crate::ledger::Ledger;
use crate::vm::entry::Stamp;
use crate::vm::transaction::{IsolationLevel, Transaction};

pub(crate) fn is_visible(ledger: &Ledger, txn: &Transaction, stamp: Stamp) -> anyhow::Result<bool> {
    match txn.level {
        IsolationLevel::ReadCommitted => read_committed(ledger, txn, stamp),
        IsolationLevel::RepeatableRead => repeatable_read(ledger, txn, stamp),
    }
}

/// Deleting a version whose deleter this transaction could not see would
/// silently skip that version.
pub(crate) fn is_version_skip(
    ledger: &Ledger,
    txn: &Transaction,
    stamp: Stamp,
) -> anyhow::Result<bool> {
    if txn.level == IsolationLevel::ReadCommitted || !stamp.is_deleted() {
        return Ok(false);
    }
    let xmax = stamp.xmax;
    Ok(ledger.is_committed(xmax)? && (xmax > txn.xid || txn.in_snapshot(xmax)))
}

fn read_committed(ledger: &Ledger, txn: &Transaction, stamp: Stamp) -> anyhow::Result<bool> {
    let Stamp { xmin, xmax } = stamp;
    if xmin == txn.xid && !stamp.is_deleted() {
        return Ok(true);
    }
    if !ledger.is_committed(xmin)? {
        return Ok(false);
    }
    if !stamp.is_deleted() {
        return Ok(true);
    }
    Ok(xmax != txn.xid && !ledger.is_committed(xmax)?)
}

fn repeatable_read(ledger: &Ledger, txn: &Transaction, stamp: Stamp) -> anyhow::Result<bool> {
    let Stamp { xmin, xmax } = stamp;
    if xmin == txn.xid && !stamp.is_deleted() {
        return Ok(true);
    }
    if !ledger.is_committed(xmin)? || xmin >= txn.xid || txn.in_snapshot(xmin) {
        return Ok(false);
    }
    if !stamp.is_deleted() {
        return Ok(true);
    }
    if xmax == txn.xid {
        return Ok(false);
    }
    Ok(!ledger.is_committed(xmax)? || xmax > txn.xid || txn.in_snapshot(xmax))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Xid;

    fn stamp(xmin: Xid, xmax: Xid) -> Stamp {
        Stamp { xmin, xmax }
    }

    #[test]
    fn test_read_committed() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::create(&dir.path().join("test.xid")).unwrap();
        let x1 = ledger.begin().unwrap();
        let x2 = ledger.begin().unwrap();
        let x3 = ledger.begin().unwrap();
        ledger.commit(x1).unwrap();

        let me = Transaction::new(x2, IsolationLevel::ReadCommitted, [x1, x3].into_iter());
        let alive = Xid::SUPER;

        assert!(is_visible(&ledger, &me, stamp(x2, alive)).unwrap());
        assert!(is_visible(&ledger, &me, stamp(x1, alive)).unwrap());
        assert!(!is_visible(&ledger, &me, stamp(x3, alive)).unwrap());
        // deleted by a running transaction
        assert!(is_visible(&ledger, &me, stamp(x1, x3)).unwrap());
        // deleted by me
        assert!(!is_visible(&ledger, &me, stamp(x1, x2)).unwrap());

        ledger.commit(x3).unwrap();
        assert!(!is_visible(&ledger, &me, stamp(x1, x3)).unwrap());
        assert!(is_visible(&ledger, &me, stamp(x3, alive)).unwrap());
        assert!(!is_version_skip(&ledger, &me, stamp(x1, x3)).unwrap());

        assert!(is_visible(&ledger, &me, stamp(Xid::SUPER, alive)).unwrap());
    }

    #[test]
    fn test_repeatable_read() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::create(&dir.path().join("test.xid")).unwrap();
        let x1 = ledger.begin().unwrap();
        let x2 = ledger.begin().unwrap();
        ledger.commit(x1).unwrap();
        let x3 = ledger.begin().unwrap();
        let x4 = ledger.begin().unwrap();

        // x2 was still running when x3 began
        let me = Transaction::new(x3, IsolationLevel::RepeatableRead, [x2].into_iter());
        let alive = Xid::SUPER;

        assert!(is_visible(&ledger, &me, stamp(x1, alive)).unwrap());
        assert!(is_visible(&ledger, &me, stamp(x3, alive)).unwrap());

        ledger.commit(x2).unwrap();
        ledger.commit(x4).unwrap();
        assert!(!is_visible(&ledger, &me, stamp(x2, alive)).unwrap());
        assert!(!is_visible(&ledger, &me, stamp(x4, alive)).unwrap());

        // deleted by transactions this snapshot cannot see
        assert!(is_visible(&ledger, &me, stamp(x1, x2)).unwrap());
        assert!(is_visible(&ledger, &me, stamp(x1, x4)).unwrap());
        assert!(is_version_skip(&ledger, &me, stamp(x1, x2)).unwrap());
        assert!(is_version_skip(&ledger, &me, stamp(x1, x4)).unwrap());

        assert!(!is_visible(&ledger, &me, stamp(x1, x3)).unwrap());
        assert!(!is_version_skip(&ledger, &me, stamp(x1, alive)).unwrap());
    }
}
