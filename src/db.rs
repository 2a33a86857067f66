use crate::btree::BPlusTree;
use crate::error::Error;
use crate::id::{Uid, Xid};
use crate::ledger::Ledger;
use crate::pager::{MIN_CACHE_PAGES, PAGE_SIZE};
use crate::store::{DataStore, StoreSetting};
use crate::vm::{IsolationLevel, VersionManager};
use anyhow::anyhow;
use std::path::Path;
use std::sync::Arc;

pub struct Db {
    ledger: Arc<Ledger>,
    store: Arc<DataStore>,
    vm: VersionManager,
}

#[derive(Debug, Clone, Copy)]
pub struct Setting {
    /// Bytes of page cache. Divided by the page size to get the number of
    /// resident pages.
    pub cache_memory: usize,
    /// Number of cached data items. 0 means unbounded.
    pub item_cache_capacity: usize,
}

impl std::default::Default for Setting {
    fn default() -> Self {
        Self {
            cache_memory: 64 << 20,
            item_cache_capacity: 0,
        }
    }
}

impl Setting {
    fn validate(&self) -> anyhow::Result<()> {
        if self.page_capacity() < MIN_CACHE_PAGES {
            return Err(Error::MemoryTooSmall.into());
        }
        Ok(())
    }

    fn page_capacity(&self) -> usize {
        self.cache_memory / PAGE_SIZE
    }

    fn store_setting(&self) -> StoreSetting {
        StoreSetting {
            page_capacity: self.page_capacity(),
            item_capacity: self.item_cache_capacity,
        }
    }
}

impl Db {
    /// Opens the database at `path`, creating it when none of its files exist.
    /// The ledger, data and log files live next to each other with the
    /// extensions `xid`, `db` and `log`.
    pub fn open(path: &Path, setting: Setting) -> anyhow::Result<Self> {
        setting.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let xid_path = path.with_extension("xid");
        let db_path = path.with_extension("db");
        let log_path = path.with_extension("log");
        let existing = [&xid_path, &db_path, &log_path]
            .iter()
            .filter(|p| p.exists())
            .count();

        let (ledger, store) = match existing {
            0 => {
                let ledger = Ledger::create(&xid_path)?;
                let store = DataStore::create(&db_path, &log_path, setting.store_setting())?;
                log::debug!("database created path={path:?}");
                (ledger, store)
            }
            3 => {
                let ledger = Ledger::open(&xid_path)?;
                let store =
                    DataStore::open(&db_path, &log_path, setting.store_setting(), &ledger)?;
                log::debug!("database opened path={path:?}");
                (ledger, store)
            }
            _ => {
                return Err(anyhow!(
                    "database at {path:?} is incomplete, {existing} of 3 files exist"
                ))
            }
        };

        let ledger = Arc::new(ledger);
        let store = Arc::new(store);
        let vm = VersionManager::new(ledger.clone(), store.clone());
        Ok(Self { ledger, store, vm })
    }

    pub fn begin(&self, level: IsolationLevel) -> anyhow::Result<Xid> {
        self.vm.begin(level)
    }

    /// Returns the record behind `uid` if it is visible to `xid`.
    pub fn read(&self, xid: Xid, uid: Uid) -> anyhow::Result<Option<Vec<u8>>> {
        self.vm.read(xid, uid)
    }

    pub fn insert(&self, xid: Xid, data: &[u8]) -> anyhow::Result<Uid> {
        self.vm.insert(xid, data)
    }

    /// Deletes the record behind `uid`. Returns false when `xid` cannot see
    /// it. Blocks while another transaction holds the record.
    pub fn delete(&self, xid: Xid, uid: Uid) -> anyhow::Result<bool> {
        self.vm.delete(xid, uid)
    }

    pub fn commit(&self, xid: Xid) -> anyhow::Result<()> {
        self.vm.commit(xid)
    }

    pub fn abort(&self, xid: Xid) -> anyhow::Result<()> {
        self.vm.abort(xid)
    }

    /// Creates an empty index and returns the uid to load it with.
    pub fn create_index(&self) -> anyhow::Result<Uid> {
        BPlusTree::create(&self.store)
    }

    pub fn load_index(&self, boot: Uid) -> anyhow::Result<BPlusTree<'_>> {
        BPlusTree::load(boot, &self.store)
    }

    /// Closes the database cleanly so that the next open skips recovery.
    pub fn shutdown(self) -> anyhow::Result<()> {
        let Self { ledger, store, vm } = self;
        drop(vm);

        store.close()?;
        drop(store);
        let ledger = Arc::try_unwrap(ledger)
            .map_err(|_| anyhow!("ledger is still referenced at shutdown"))?;
        ledger.close()?;
        log::debug!("database shut down");
        Ok(())
    }
}
