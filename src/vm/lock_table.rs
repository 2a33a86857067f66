use crate::error::Error;
use crate::id::{Uid, Xid};
use indexmap::IndexSet;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;

/// Handle returned to a transaction that has to wait for a uid. It is
/// signalled once the uid is handed over.
pub(crate) struct LockWaiter {
    granted: Mutex<bool>,
    cond: Condvar,
}

impl LockWaiter {
    fn new() -> Self {
        Self {
            granted: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn wait(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cond.wait(&mut granted);
        }
    }

    fn grant(&self) {
        *self.granted.lock() = true;
        self.cond.notify_all();
    }
}

/// Tracks which transaction holds which uid and who waits for what, and
/// refuses waits that would deadlock.
pub(crate) struct LockTable {
    graph: Mutex<WaitGraph>,
}

#[derive(Default)]
struct WaitGraph {
    // uids held by each transaction
    holding: HashMap<Xid, Vec<Uid>>,
    // holder of each uid
    holder: HashMap<Uid, Xid>,
    // waiters of each uid in arrival order
    waiters: HashMap<Uid, IndexSet<Xid>>,
    // the uid each blocked transaction waits for
    waiting_for: HashMap<Xid, Uid>,
    signals: HashMap<Xid, Arc<LockWaiter>>,

    stamps: HashMap<Xid, usize>,
    stamp: usize,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self {
            graph: Mutex::new(WaitGraph::default()),
        }
    }

    /// Acquires `uid` for `xid`. Returns `None` when the uid is granted right
    /// away and a waiter otherwise. Fails with [`Error::Deadlock`] when waiting
    /// would close a cycle; nothing is recorded in that case.
    pub(crate) fn add(&self, xid: Xid, uid: Uid) -> anyhow::Result<Option<Arc<LockWaiter>>> {
        let mut graph = self.graph.lock();
        if graph.is_holding(xid, uid) {
            return Ok(None);
        }
        if !graph.holder.contains_key(&uid) {
            graph.holder.insert(uid, xid);
            graph.holding.entry(xid).or_default().push(uid);
            return Ok(None);
        }

        graph.waiting_for.insert(xid, uid);
        graph.waiters.entry(uid).or_default().insert(xid);
        if graph.has_deadlock() {
            graph.waiting_for.remove(&xid);
            if let Some(waiters) = graph.waiters.get_mut(&uid) {
                waiters.shift_remove(&xid);
                if waiters.is_empty() {
                    graph.waiters.remove(&uid);
                }
            }
            log::debug!("deadlock detected xid={xid:?} uid={uid:?}");
            return Err(Error::Deadlock.into());
        }

        let waiter = Arc::new(LockWaiter::new());
        graph.signals.insert(xid, waiter.clone());
        Ok(Some(waiter))
    }

    /// Releases everything `xid` holds, handing each uid to its longest
    /// waiting transaction.
    pub(crate) fn remove(&self, xid: Xid) {
        let mut graph = self.graph.lock();
        if let Some(uids) = graph.holding.remove(&xid) {
            for uid in uids {
                graph.hand_over(uid);
            }
        }

        if let Some(uid) = graph.waiting_for.remove(&xid) {
            if let Some(waiters) = graph.waiters.get_mut(&uid) {
                waiters.shift_remove(&xid);
                if waiters.is_empty() {
                    graph.waiters.remove(&uid);
                }
            }
        }
        graph.signals.remove(&xid);
    }
}

impl WaitGraph {
    fn is_holding(&self, xid: Xid, uid: Uid) -> bool {
        self.holding
            .get(&xid)
            .is_some_and(|uids| uids.contains(&uid))
    }

    fn hand_over(&mut self, uid: Uid) {
        self.holder.remove(&uid);
        let Some(waiters) = self.waiters.get_mut(&uid) else {
            return;
        };

        let mut next = None;
        while let Some(xid) = waiters.shift_remove_index(0) {
            if self.signals.contains_key(&xid) {
                next = Some(xid);
                break;
            }
        }
        if waiters.is_empty() {
            self.waiters.remove(&uid);
        }

        if let Some(xid) = next {
            self.holder.insert(uid, xid);
            self.holding.entry(xid).or_default().push(uid);
            self.waiting_for.remove(&xid);
            if let Some(signal) = self.signals.remove(&xid) {
                signal.grant();
            }
        }
    }

    fn has_deadlock(&mut self) -> bool {
        self.stamps.clear();
        self.stamp = 1;
        let xids = self.holding.keys().copied().collect::<Vec<_>>();
        for xid in xids {
            if self.stamps.get(&xid).is_some_and(|s| *s > 0) {
                continue;
            }
            self.stamp += 1;
            if self.walk(xid) {
                return true;
            }
        }
        false
    }

    // every transaction waits for at most one uid, so the walk is a path
    fn walk(&mut self, mut xid: Xid) -> bool {
        loop {
            match self.stamps.get(&xid) {
                Some(&s) if s == self.stamp => return true,
                Some(&s) if s < self.stamp => return false,
                _ => {}
            }
            self.stamps.insert(xid, self.stamp);

            let Some(uid) = self.waiting_for.get(&xid) else {
                return false;
            };
            let Some(&holder) = self.holder.get(uid) else {
                return false;
            };
            xid = holder;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn uid(n: u64) -> Uid {
        Uid::from_raw((1 << 32) | n)
    }

    #[test]
    fn test_grant_and_reenter() {
        let table = LockTable::new();
        let x1 = Xid::new(1);
        assert!(table.add(x1, uid(1)).unwrap().is_none());
        assert!(table.add(x1, uid(1)).unwrap().is_none());
        table.remove(x1);
        assert!(table.add(Xid::new(2), uid(1)).unwrap().is_none());
    }

    #[test]
    fn test_deadlock() {
        let table = LockTable::new();
        let a = Xid::new(1);
        let b = Xid::new(2);
        assert!(table.add(a, uid(1)).unwrap().is_none());
        assert!(table.add(b, uid(2)).unwrap().is_none());

        let waiter = table.add(a, uid(2)).unwrap();
        assert!(waiter.is_some());

        let err = table.add(b, uid(1)).err().unwrap();
        assert_eq!(Some(&Error::Deadlock), err.downcast_ref::<Error>());

        // the victim goes away, a gets the uid
        table.remove(b);
        waiter.unwrap().wait();
        assert!(table.add(a, uid(2)).unwrap().is_none());
    }

    #[test]
    fn test_deadlock_longer_cycle() {
        let table = LockTable::new();
        let xids = (1..=4).map(Xid::new).collect::<Vec<_>>();
        for (i, xid) in xids.iter().enumerate() {
            assert!(table.add(*xid, uid(i as u64)).unwrap().is_none());
        }
        for i in 0..3 {
            assert!(table.add(xids[i], uid(i as u64 + 1)).unwrap().is_some());
        }
        let err = table.add(xids[3], uid(0)).err().unwrap();
        assert_eq!(Some(&Error::Deadlock), err.downcast_ref::<Error>());

        // waiting on something outside the chain is fine
        assert!(table.add(Xid::new(5), uid(3)).unwrap().is_some());
    }

    #[test]
    fn test_fifo_hand_over() {
        let table = LockTable::new();
        let holder = Xid::new(1);
        let first = Xid::new(2);
        let second = Xid::new(3);
        table.add(holder, uid(1)).unwrap();
        let w1 = table.add(first, uid(1)).unwrap().unwrap();
        let w2 = table.add(second, uid(1)).unwrap().unwrap();

        table.remove(holder);
        w1.wait();
        assert!(!*w2.granted.lock());

        table.remove(first);
        w2.wait();
        assert!(table.add(second, uid(1)).unwrap().is_none());
    }

    #[test]
    fn test_waiter_blocks_until_release() {
        let table = LockTable::new();
        let holder = Xid::new(1);
        let waiter_xid = Xid::new(2);
        table.add(holder, uid(9)).unwrap();
        let waiter = table.add(waiter_xid, uid(9)).unwrap().unwrap();

        let released = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                waiter.wait();
                assert!(released.load(Ordering::SeqCst));
            });
            std::thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            table.remove(holder);
        });
    }
}
