mod entry;
mod lock_table;
mod transaction;
mod visibility;

use crate::error::Error;
use crate::id::{Uid, Xid};
use crate::ledger::Ledger;
use crate::store::DataStore;
use crate::vm::entry::{wrap_entry_raw, Entry};
use crate::vm::lock_table::LockTable;
use crate::vm::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub use crate::vm::transaction::IsolationLevel;

/// Multi-version access to records. Every record is an entry stamped with its
/// creator and deleter; which version a transaction sees depends on its
/// isolation level.
pub(crate) struct VersionManager {
    ledger: Arc<Ledger>,
    store: Arc<DataStore>,
    active: Mutex<HashMap<Xid, Arc<Transaction>>>,
    // used for reads and inserts on behalf of the super transaction
    super_txn: Arc<Transaction>,
    lock_table: LockTable,
}

impl VersionManager {
    pub(crate) fn new(ledger: Arc<Ledger>, store: Arc<DataStore>) -> Self {
        Self {
            ledger,
            store,
            active: Mutex::new(HashMap::default()),
            super_txn: Arc::new(Transaction::new(
                Xid::SUPER,
                IsolationLevel::ReadCommitted,
                std::iter::empty(),
            )),
            lock_table: LockTable::new(),
        }
    }

    pub(crate) fn begin(&self, level: IsolationLevel) -> anyhow::Result<Xid> {
        let mut active = self.active.lock();
        let xid = self.ledger.begin()?;
        let txn = Transaction::new(xid, level, active.keys().copied());
        active.insert(xid, Arc::new(txn));
        log::debug!("transaction started xid={xid:?} level={level:?}");
        Ok(xid)
    }

    fn transaction(&self, xid: Xid) -> anyhow::Result<Arc<Transaction>> {
        if xid.is_super() {
            return Ok(self.super_txn.clone());
        }
        self.active
            .lock()
            .get(&xid)
            .cloned()
            .ok_or_else(|| Error::NoTransaction.into())
    }

    pub(crate) fn read(&self, xid: Xid, uid: Uid) -> anyhow::Result<Option<Vec<u8>>> {
        let txn = self.transaction(xid)?;
        txn.check()?;

        let Some(entry) = Entry::load(&self.store, uid)? else {
            return Ok(None);
        };
        if visibility::is_visible(&self.ledger, &txn, entry.stamp()?)? {
            Ok(Some(entry.data()))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn insert(&self, xid: Xid, data: &[u8]) -> anyhow::Result<Uid> {
        let txn = self.transaction(xid)?;
        txn.check()?;
        self.store.insert(xid, &wrap_entry_raw(xid, data))
    }

    /// Marks the version behind `uid` as deleted by `xid`. Returns false when
    /// the version is not visible to `xid` or was already deleted by it.
    pub(crate) fn delete(&self, xid: Xid, uid: Uid) -> anyhow::Result<bool> {
        let txn = self.transaction(xid)?;
        txn.check()?;

        let Some(entry) = Entry::load(&self.store, uid)? else {
            return Ok(false);
        };
        if !visibility::is_visible(&self.ledger, &txn, entry.stamp()?)? {
            return Ok(false);
        }

        match self.lock_table.add(xid, uid) {
            Ok(Some(waiter)) => waiter.wait(),
            Ok(None) => (),
            // the victim sees a deadlock as a plain conflict
            Err(err) if err.downcast_ref::<Error>() == Some(&Error::Deadlock) => {
                return Err(self.auto_abort(&txn, Error::ConcurrentUpdate));
            }
            Err(err) => return Err(err),
        }

        // the entry write lock is the serialization point, everything below
        // is decided on the stamp seen under it
        let w = entry.before();
        let stamp = w.stamp();
        if stamp.xmax == xid {
            w.cancel();
            return Ok(false);
        }
        if visibility::is_version_skip(&self.ledger, &txn, stamp)? {
            w.cancel();
            return Err(self.auto_abort(&txn, Error::ConcurrentUpdate));
        }
        if !visibility::is_visible(&self.ledger, &txn, stamp)? {
            w.cancel();
            return Ok(false);
        }

        w.set_xmax(xid)?;
        Ok(true)
    }

    pub(crate) fn commit(&self, xid: Xid) -> anyhow::Result<()> {
        if xid.is_super() {
            return Err(anyhow::anyhow!("the super transaction cannot be committed"));
        }
        let txn = self.transaction(xid)?;
        if let Some(err) = txn.error() {
            panic!("transaction {xid:?} cannot be committed after it failed: {err}");
        }

        {
            let mut active = self.active.lock();
            self.ledger.commit(xid)?;
            active.remove(&xid);
        }
        self.lock_table.remove(xid);
        log::debug!("transaction committed xid={xid:?}");
        Ok(())
    }

    pub(crate) fn abort(&self, xid: Xid) -> anyhow::Result<()> {
        if xid.is_super() {
            return Err(anyhow::anyhow!("the super transaction cannot be aborted"));
        }
        let txn = self
            .active
            .lock()
            .remove(&xid)
            .ok_or(Error::NoTransaction)?;
        if txn.is_auto_aborted() {
            return Ok(());
        }

        self.ledger.abort(xid)?;
        self.lock_table.remove(xid);
        log::debug!("transaction aborted xid={xid:?}");
        Ok(())
    }

    /// Aborts a conflicting transaction on its owner's behalf. It stays in the
    /// active set so that every later call sees the stored error until the
    /// owner calls `abort`.
    fn auto_abort(&self, txn: &Transaction, err: Error) -> anyhow::Error {
        txn.set_error(err);
        if !txn.xid.is_super() && !txn.is_auto_aborted() {
            if let Err(abort_err) = self.ledger.abort(txn.xid) {
                return abort_err;
            }
            self.lock_table.remove(txn.xid);
            txn.set_auto_aborted();
        }
        log::debug!("transaction auto aborted xid={:?} err={err}", txn.xid);
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreSetting;
    use std::time::Duration;

    struct Env {
        _dir: tempfile::TempDir,
        vm: VersionManager,
    }

    fn setup() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(Ledger::create(&dir.path().join("test.xid")).unwrap());
        let store = Arc::new(
            DataStore::create(
                &dir.path().join("test.db"),
                &dir.path().join("test.log"),
                StoreSetting {
                    page_capacity: 64,
                    item_capacity: 0,
                },
            )
            .unwrap(),
        );
        Env {
            _dir: dir,
            vm: VersionManager::new(ledger, store),
        }
    }

    fn expect_error<T>(result: anyhow::Result<T>, expected: Error) {
        let err = result.err().unwrap();
        assert_eq!(Some(&expected), err.downcast_ref::<Error>(), "got {err:?}");
    }

    #[test]
    fn test_insert_read_delete() {
        let env = setup();
        let vm = &env.vm;

        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x1, b"row").unwrap();
        assert_eq!(Some(b"row".to_vec()), vm.read(x1, uid).unwrap());

        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(None, vm.read(x2, uid).unwrap());
        vm.commit(x1).unwrap();
        assert_eq!(Some(b"row".to_vec()), vm.read(x2, uid).unwrap());

        assert!(vm.delete(x2, uid).unwrap());
        assert!(!vm.delete(x2, uid).unwrap());
        assert_eq!(None, vm.read(x2, uid).unwrap());
        vm.commit(x2).unwrap();

        let x3 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(None, vm.read(x3, uid).unwrap());
        assert!(!vm.delete(x3, uid).unwrap());
        vm.commit(x3).unwrap();
    }

    #[test]
    fn test_aborted_delete_is_undone_logically() {
        let env = setup();
        let vm = &env.vm;

        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x1, b"row").unwrap();
        vm.commit(x1).unwrap();

        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x2, uid).unwrap());
        vm.abort(x2).unwrap();

        let x3 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(Some(b"row".to_vec()), vm.read(x3, uid).unwrap());
        assert!(vm.delete(x3, uid).unwrap());
        vm.commit(x3).unwrap();
    }

    #[test]
    fn test_unknown_transaction() {
        let env = setup();
        expect_error(env.vm.read(Xid::new(42), Uid::from_raw(1 << 32)), Error::NoTransaction);
        expect_error(env.vm.abort(Xid::new(42)), Error::NoTransaction);
    }

    #[test]
    fn test_super_transaction() {
        let env = setup();
        let vm = &env.vm;
        let uid = vm.insert(Xid::SUPER, b"meta").unwrap();

        let x1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(Some(b"meta".to_vec()), vm.read(x1, uid).unwrap());
        assert_eq!(Some(b"meta".to_vec()), vm.read(Xid::SUPER, uid).unwrap());
        assert!(vm.commit(Xid::SUPER).is_err());
    }

    #[test]
    fn test_version_skip() {
        let env = setup();
        let vm = &env.vm;

        let x0 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x0, b"0").unwrap();
        vm.commit(x0).unwrap();

        let x1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(Some(b"0".to_vec()), vm.read(x1, uid).unwrap());

        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x2, uid).unwrap());
        let new_uid = vm.insert(x2, b"1").unwrap();
        vm.commit(x2).unwrap();

        expect_error(vm.delete(x1, uid), Error::ConcurrentUpdate);
        // the failure sticks to the transaction
        expect_error(vm.read(x1, new_uid), Error::ConcurrentUpdate);
        expect_error(vm.insert(x1, b"2"), Error::ConcurrentUpdate);
        vm.abort(x1).unwrap();
        expect_error(vm.read(x1, uid), Error::NoTransaction);
    }

    #[test]
    #[should_panic(expected = "cannot be committed after it failed")]
    fn test_commit_failed_transaction() {
        let env = setup();
        let vm = &env.vm;

        let x0 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x0, b"0").unwrap();
        vm.commit(x0).unwrap();

        let x1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x2, uid).unwrap());
        vm.commit(x2).unwrap();

        assert!(vm.delete(x1, uid).is_err());
        let _ = vm.commit(x1);
    }

    #[test]
    fn test_delete_waits_for_holder() {
        let env = setup();
        let vm = &env.vm;

        let x0 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x0, b"row").unwrap();
        vm.commit(x0).unwrap();

        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x1, uid).unwrap());

        std::thread::scope(|s| {
            let handle = s.spawn(|| vm.delete(x2, uid).unwrap());
            std::thread::sleep(Duration::from_millis(50));
            vm.abort(x1).unwrap();
            // x1 gave up, so x2 deletes the row itself
            assert!(handle.join().unwrap());
        });
        vm.commit(x2).unwrap();

        let x3 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let x4 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(Xid::SUPER, b"other").unwrap();
        assert!(vm.delete(x3, uid).unwrap());
        std::thread::scope(|s| {
            let handle = s.spawn(|| vm.delete(x4, uid).unwrap());
            std::thread::sleep(Duration::from_millis(50));
            vm.commit(x3).unwrap();
            // the row is gone by the time x4 gets the lock
            assert!(!handle.join().unwrap());
        });
        vm.commit(x4).unwrap();
    }

    #[test]
    fn test_deadlock() {
        let env = setup();
        let vm = &env.vm;

        let uid1 = vm.insert(Xid::SUPER, b"one").unwrap();
        let uid2 = vm.insert(Xid::SUPER, b"two").unwrap();

        let a = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let b = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(a, uid1).unwrap());
        assert!(vm.delete(b, uid2).unwrap());

        std::thread::scope(|s| {
            let handle = s.spawn(|| vm.delete(a, uid2));
            std::thread::sleep(Duration::from_millis(50));

            expect_error(vm.delete(b, uid1), Error::ConcurrentUpdate);
            // b was aborted and released uid2, so a goes through
            assert!(handle.join().unwrap().unwrap());
        });
        expect_error(vm.read(b, uid1), Error::ConcurrentUpdate);
        vm.abort(b).unwrap();
        vm.commit(a).unwrap();

        let c = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(None, vm.read(c, uid1).unwrap());
        assert_eq!(None, vm.read(c, uid2).unwrap());
    }
}
