use crate::error::Error;
use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// The resource side of a [`RefCache`]: how to bring a value in and what to do
/// when its last reference goes away.
pub(crate) trait CacheSource {
    type Key: Copy + Eq + Hash + Debug;
    type Value;

    fn load(&self, key: Self::Key) -> anyhow::Result<Self::Value>;

    fn evict(&self, key: Self::Key, value: &Self::Value) -> anyhow::Result<()>;
}

/// Reference counted cache. A value stays resident as long as somebody holds a
/// reference to it and is evicted as soon as the count drops to zero. Each key
/// is loaded at most once at a time; concurrent callers of the same key wait
/// for the in-flight load.
pub(crate) struct RefCache<S: CacheSource> {
    source: S,
    // 0 means unbounded
    capacity: usize,
    inner: Mutex<CacheInner<S::Key, S::Value>>,
    loaded: Condvar,
}

struct CacheInner<K, V> {
    slots: HashMap<K, Slot<V>>,
    count: usize,
}

enum Slot<V> {
    Loading,
    Ready { value: Arc<V>, refs: usize },
}

impl<S: CacheSource> RefCache<S> {
    pub(crate) fn new(source: S, capacity: usize) -> Self {
        Self {
            source,
            capacity,
            inner: Mutex::new(CacheInner {
                slots: HashMap::default(),
                count: 0,
            }),
            loaded: Condvar::new(),
        }
    }

    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    pub(crate) fn get(&self, key: S::Key) -> anyhow::Result<Arc<S::Value>> {
        let mut inner = self.inner.lock();
        loop {
            match inner.slots.get_mut(&key) {
                Some(Slot::Loading) => {
                    self.loaded.wait(&mut inner);
                }
                Some(Slot::Ready { value, refs }) => {
                    *refs += 1;
                    return Ok(value.clone());
                }
                None => {
                    if self.capacity > 0 && inner.count >= self.capacity {
                        return Err(Error::CacheFull.into());
                    }
                    inner.count += 1;
                    inner.slots.insert(key, Slot::Loading);
                    break;
                }
            }
        }
        drop(inner);

        log::trace!("cache miss key={key:?}");
        let result = self.source.load(key);

        let mut inner = self.inner.lock();
        let result = match result {
            Ok(value) => {
                let value = Arc::new(value);
                inner.slots.insert(
                    key,
                    Slot::Ready {
                        value: value.clone(),
                        refs: 1,
                    },
                );
                Ok(value)
            }
            Err(err) => {
                inner.slots.remove(&key);
                inner.count -= 1;
                Err(err)
            }
        };
        self.loaded.notify_all();
        result
    }

    pub(crate) fn release(&self, key: S::Key) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let Some(Slot::Ready { refs, .. }) = inner.slots.get_mut(&key) else {
            return Err(anyhow!("releasing key {key:?} which is not held"));
        };
        *refs -= 1;
        if *refs > 0 {
            return Ok(());
        }

        let Some(Slot::Ready { value, .. }) = inner.slots.remove(&key) else {
            unreachable!();
        };
        inner.count -= 1;
        log::trace!("cache evict key={key:?}");
        // evicting under the lock keeps a concurrent get from reloading a
        // value whose eviction has not finished yet
        self.source.evict(key, &value)
    }

    /// Evicts every resident value regardless of its reference count.
    pub(crate) fn close(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let mut result = Ok(());
        for (key, slot) in inner.slots.drain() {
            if let Slot::Ready { value, .. } = slot {
                if let Err(err) = self.source.evict(key, &value) {
                    log::error!("cannot evict key={key:?} on close: {err}");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        inner.count = 0;
        result
    }
}
