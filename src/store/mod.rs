mod item;

use crate::cache::{CacheSource, RefCache};
use crate::error::Error;
use crate::free_space::FreeSpaceIndex;
use crate::id::{Pgno, Uid, Xid};
use crate::ledger::Ledger;
use crate::log::WalRecord;
use crate::pager::{init_data_page, init_first_page, Page, Pager, MAX_FREE_SPACE};
use crate::recovery::recover;
use crate::wal::Wal;
use anyhow::anyhow;
use std::path::Path;
use std::sync::Arc;

pub(crate) use item::{mark_invalid, wrap_item_raw, DataItem, DataItemRef, DataItemWrite};

const MAX_PLACEMENT_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy)]
pub(crate) struct StoreSetting {
    pub(crate) page_capacity: usize,
    // 0 means unbounded
    pub(crate) item_capacity: usize,
}

/// Record storage on top of the page pool and the write-ahead log.
pub(crate) struct DataStore {
    pager: Arc<Pager>,
    wal: Wal,
    items: RefCache<ItemLoader>,
    free_space: FreeSpaceIndex,
    first_page: Arc<Page>,
}

struct ItemLoader {
    pager: Arc<Pager>,
}

impl CacheSource for ItemLoader {
    type Key = Uid;
    type Value = DataItem;

    fn load(&self, uid: Uid) -> anyhow::Result<DataItem> {
        let pgno = uid.pgno()?;
        let page = self.pager.get(pgno)?;
        match DataItem::parse(uid, page) {
            Ok(item) => Ok(item),
            Err(err) => {
                self.pager.release(pgno)?;
                Err(err)
            }
        }
    }

    fn evict(&self, _uid: Uid, item: &DataItem) -> anyhow::Result<()> {
        self.pager.release(item.page().pgno())
    }
}

impl DataStore {
    pub(crate) fn create(
        db_path: &Path,
        log_path: &Path,
        setting: StoreSetting,
    ) -> anyhow::Result<Self> {
        let pager = Arc::new(Pager::create(db_path, setting.page_capacity)?);
        let wal = Wal::create(log_path)?;

        let first = pager.new_page(&init_first_page())?;
        assert_eq!(Pgno::FIRST, first, "first page must be allocated first");
        let first_page = pager.get(first)?;
        pager.flush(&first_page)?;

        log::debug!("data store created path={db_path:?}");
        Ok(Self::new(pager, wal, setting, first_page))
    }

    /// Opens an existing store. An unclean previous shutdown is repaired from
    /// the log before anything else touches the pages.
    pub(crate) fn open(
        db_path: &Path,
        log_path: &Path,
        setting: StoreSetting,
        ledger: &Ledger,
    ) -> anyhow::Result<Self> {
        let pager = Arc::new(Pager::open(db_path, setting.page_capacity)?);
        if pager.page_count() == 0 {
            return Err(anyhow!("data file {db_path:?} has no pages"));
        }
        let wal = Wal::open(log_path)?;

        let first_page = pager.get(Pgno::FIRST)?;
        if !first_page.check_vc() {
            log::debug!("database was not closed cleanly, starting recovery");
            recover(ledger, &wal, &pager)?;
        }

        let store = Self::new(pager, wal, setting, first_page);
        store.fill_free_space()?;

        store.first_page.set_vc_open();
        store.pager.flush(&store.first_page)?;
        log::debug!(
            "data store opened path={db_path:?} page_count={}",
            store.pager.page_count()
        );
        Ok(store)
    }

    fn new(pager: Arc<Pager>, wal: Wal, setting: StoreSetting, first_page: Arc<Page>) -> Self {
        let items = RefCache::new(
            ItemLoader {
                pager: pager.clone(),
            },
            setting.item_capacity,
        );
        Self {
            pager,
            wal,
            items,
            free_space: FreeSpaceIndex::new(),
            first_page,
        }
    }

    fn fill_free_space(&self) -> anyhow::Result<()> {
        for pgno in 2..=self.pager.page_count() {
            let Some(pgno) = Pgno::new(pgno) else {
                continue;
            };
            let page = self.pager.read(pgno)?;
            self.free_space.add(pgno, page.free_space());
        }
        Ok(())
    }

    pub(crate) fn insert(&self, xid: Xid, data: &[u8]) -> anyhow::Result<Uid> {
        let raw = wrap_item_raw(data);
        if raw.len() > MAX_FREE_SPACE {
            return Err(Error::DataTooLarge.into());
        }

        let mut info = None;
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            info = self.free_space.select(raw.len());
            if info.is_some() {
                break;
            }
            let pgno = self.pager.new_page(&init_data_page())?;
            self.free_space.add(pgno, MAX_FREE_SPACE);
        }
        let Some(info) = info else {
            return Err(Error::DatabaseBusy.into());
        };

        let page = match self.pager.read(info.pgno) {
            Ok(page) => page,
            Err(err) => {
                self.free_space.add(info.pgno, 0);
                return Err(err);
            }
        };
        let result = self.insert_into(&page, xid, &raw);
        self.free_space.add(info.pgno, page.free_space());
        result
    }

    fn insert_into(&self, page: &Page, xid: Xid, raw: &[u8]) -> anyhow::Result<Uid> {
        if page.free_space() < raw.len() {
            return Err(anyhow!(
                "page {:?} has no room for {} bytes",
                page.pgno(),
                raw.len()
            ));
        }
        let offset = page.fso() as u16;
        let record = WalRecord::Insert {
            xid,
            pgno: page.pgno(),
            offset,
            raw,
        };
        self.wal.log(&record.encode())?;

        let actual = page.append(raw)?;
        assert_eq!(offset, actual, "page moved while it was checked out");
        Ok(Uid::from_parts(page.pgno(), offset))
    }

    /// Returns the item behind `uid`, or `None` when the slot was deleted.
    pub(crate) fn read(&self, uid: Uid) -> anyhow::Result<Option<DataItemRef<'_>>> {
        let item = self.items.get(uid)?;
        let item = DataItemRef { store: self, item };
        if !item.item.is_valid() {
            return Ok(None);
        }
        Ok(Some(item))
    }

    fn release(&self, uid: Uid) -> anyhow::Result<()> {
        self.items.release(uid)
    }

    /// Orderly shutdown. The log is closed before page 1 declares the clean
    /// shutdown.
    pub(crate) fn close(&self) -> anyhow::Result<()> {
        self.items.close()?;
        self.wal.close()?;

        self.first_page.set_vc_close();
        self.pager.flush(&self.first_page)?;
        self.pager.release(Pgno::FIRST)?;
        self.pager.close()?;
        log::debug!("data store closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{MIN_CACHE_PAGES, PAGE_SIZE};
    use std::path::PathBuf;

    pub(crate) const TEST_SETTING: StoreSetting = StoreSetting {
        page_capacity: 64,
        item_capacity: 0,
    };

    struct Paths {
        _dir: tempfile::TempDir,
        db: PathBuf,
        log: PathBuf,
        xid: PathBuf,
    }

    fn paths() -> Paths {
        let dir = tempfile::tempdir().unwrap();
        Paths {
            db: dir.path().join("test.db"),
            log: dir.path().join("test.log"),
            xid: dir.path().join("test.xid"),
            _dir: dir,
        }
    }

    #[test]
    fn test_insert_and_read() {
        let paths = paths();
        let store = DataStore::create(&paths.db, &paths.log, TEST_SETTING).unwrap();

        let uid = store.insert(Xid::SUPER, b"hello world").unwrap();
        assert_eq!(2, uid.page());
        assert_eq!(2, uid.offset());

        let item = store.read(uid).unwrap().unwrap();
        assert_eq!(uid, item.uid());
        assert_eq!(b"hello world".to_vec(), item.data());
        drop(item);

        let uid2 = store.insert(Xid::SUPER, b"second").unwrap();
        assert_eq!(2, uid2.page());
        assert_eq!(2 + 3 + 11, uid2.offset());
        store.close().unwrap();
    }

    #[test]
    fn test_data_too_large() {
        let paths = paths();
        let store = DataStore::create(&paths.db, &paths.log, TEST_SETTING).unwrap();

        let err = store
            .insert(Xid::SUPER, &vec![0u8; MAX_FREE_SPACE])
            .unwrap_err();
        assert_eq!(Some(&Error::DataTooLarge), err.downcast_ref::<Error>());

        let uid = store
            .insert(Xid::SUPER, &vec![7u8; MAX_FREE_SPACE - 3])
            .unwrap();
        assert_eq!(vec![7u8; MAX_FREE_SPACE - 3], store.read(uid).unwrap().unwrap().data());
    }

    #[test]
    fn test_full_record_after_small_one() {
        let paths = paths();
        let ledger = Ledger::create(&paths.xid).unwrap();
        let store = DataStore::create(&paths.db, &paths.log, TEST_SETTING).unwrap();

        let small = store.insert(Xid::SUPER, b"").unwrap();
        // page 2 is 3 bytes short for this one
        let full = store
            .insert(Xid::SUPER, &vec![1u8; MAX_FREE_SPACE - 3])
            .unwrap();
        assert_eq!(2, small.page());
        assert_eq!(3, full.page());
        drop(store);

        // unclean shutdown, the log is replayed
        let store = DataStore::open(&paths.db, &paths.log, TEST_SETTING, &ledger).unwrap();
        assert_eq!(Vec::<u8>::new(), store.read(small).unwrap().unwrap().data());
        assert_eq!(
            vec![1u8; MAX_FREE_SPACE - 3],
            store.read(full).unwrap().unwrap().data()
        );
        store.close().unwrap();
    }

    #[test]
    fn test_no_log_record_for_page_without_room() {
        let paths = paths();
        let store = DataStore::create(&paths.db, &paths.log, TEST_SETTING).unwrap();
        store.insert(Xid::SUPER, b"abc").unwrap();

        let page = store.pager.read(Pgno::new(2).unwrap()).unwrap();
        let raw = wrap_item_raw(&vec![0u8; MAX_FREE_SPACE - 3]);
        assert!(store.insert_into(&page, Xid::SUPER, &raw).is_err());
        drop(page);

        let mut iter = store.wal.iter();
        let mut n = 0;
        while iter.next().unwrap().is_some() {
            n += 1;
        }
        assert_eq!(1, n);
        store.close().unwrap();
    }

    #[test]
    fn test_page_placement() {
        let paths = paths();
        let store = DataStore::create(&paths.db, &paths.log, TEST_SETTING).unwrap();

        let data = vec![1u8; 3000];
        let uids = (0..5)
            .map(|_| store.insert(Xid::SUPER, &data).unwrap())
            .collect::<Vec<_>>();

        // two records fit in a page, the third needs a new one
        assert_eq!(uids[0].page(), uids[1].page());
        assert_ne!(uids[1].page(), uids[2].page());
        assert!(store.pager.page_count() >= 4);
        for uid in &uids {
            assert!(uid.offset() as usize + 3 + data.len() <= PAGE_SIZE);
            assert_eq!(data, store.read(*uid).unwrap().unwrap().data());
        }
    }

    #[test]
    fn test_before_after() {
        let paths = paths();
        let store = DataStore::create(&paths.db, &paths.log, TEST_SETTING).unwrap();
        let uid = store.insert(Xid::SUPER, b"aaaa").unwrap();

        let item = store.read(uid).unwrap().unwrap();
        let mut w = item.before();
        w.write(1, b"bb");
        assert_eq!(b"abba".to_vec(), w.data());
        w.un_before();
        assert_eq!(b"aaaa".to_vec(), item.data());

        let mut w = item.before();
        w.write(0, b"cc");
        drop(w);
        assert_eq!(b"aaaa".to_vec(), item.data());

        let mut w = item.before();
        w.write(2, b"dd");
        w.after(Xid::SUPER).unwrap();
        assert_eq!(b"aadd".to_vec(), item.data());

        // insert + update records
        let mut iter = store.wal.iter();
        let mut records = vec![];
        while let Some(data) = iter.next().unwrap() {
            records.push(data);
        }
        assert_eq!(2, records.len());
        let WalRecord::Update {
            old_raw, new_raw, ..
        } = WalRecord::decode(&records[1]).unwrap()
        else {
            panic!("expected update record");
        };
        assert_eq!(b"aaaa", &old_raw[3..]);
        assert_eq!(b"aadd", &new_raw[3..]);
    }

    #[test]
    fn test_reopen() {
        let paths = paths();
        let ledger = Ledger::create(&paths.xid).unwrap();
        let store = DataStore::create(&paths.db, &paths.log, TEST_SETTING).unwrap();
        let uids = (0..100)
            .map(|i| store.insert(Xid::SUPER, format!("item{i}").as_bytes()).unwrap())
            .collect::<Vec<_>>();
        store.close().unwrap();
        drop(store);

        let store = DataStore::open(&paths.db, &paths.log, TEST_SETTING, &ledger).unwrap();
        for (i, uid) in uids.iter().enumerate() {
            let item = store.read(*uid).unwrap().unwrap();
            assert_eq!(format!("item{i}").into_bytes(), item.data());
        }

        // the partially filled page is reused
        let uid = store.insert(Xid::SUPER, b"more").unwrap();
        assert_eq!(uids[99].page(), uid.page());
        store.close().unwrap();
    }

    #[test]
    fn test_item_cache_full() {
        let paths = paths();
        let setting = StoreSetting {
            page_capacity: MIN_CACHE_PAGES,
            item_capacity: 1,
        };
        let store = DataStore::create(&paths.db, &paths.log, setting).unwrap();
        let a = store.insert(Xid::SUPER, b"a").unwrap();
        let b = store.insert(Xid::SUPER, b"b").unwrap();

        let item = store.read(a).unwrap().unwrap();
        let err = store.read(b).err().unwrap();
        assert_eq!(Some(&Error::CacheFull), err.downcast_ref::<Error>());
        drop(item);
        assert!(store.read(b).unwrap().is_some());
    }
}
