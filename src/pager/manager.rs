use crate::cache::RefCache;
use crate::error::{fatal, Error};
use crate::id::Pgno;
use crate::pager::file_manager::FileManager;
use crate::pager::page::{Page, PAGE_SIZE};
use anyhow::anyhow;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Smallest number of pages the pool can work with.
pub(crate) const MIN_CACHE_PAGES: usize = 10;

/// Page buffer pool over the data file. Pages are loaded on first use, stay
/// resident while referenced and are written back when the last reference is
/// released. Every write is synchronous.
pub(crate) struct Pager {
    cache: RefCache<FileManager>,
    page_count: AtomicU32,
}

impl Pager {
    pub(crate) fn create(path: &Path, capacity: usize) -> anyhow::Result<Self> {
        Self::check_capacity(capacity)?;
        let file = FileManager::create(path)?;
        Ok(Self {
            cache: RefCache::new(file, capacity),
            page_count: AtomicU32::new(0),
        })
    }

    pub(crate) fn open(path: &Path, capacity: usize) -> anyhow::Result<Self> {
        Self::check_capacity(capacity)?;
        let file = FileManager::open(path)?;
        let page_count = file.file_len()? / PAGE_SIZE as u64;
        let page_count =
            u32::try_from(page_count).map_err(|_| anyhow!("data file is too large"))?;
        log::debug!("pager opened path={path:?} page_count={page_count}");
        Ok(Self {
            cache: RefCache::new(file, capacity),
            page_count: AtomicU32::new(page_count),
        })
    }

    fn check_capacity(capacity: usize) -> anyhow::Result<()> {
        if capacity < MIN_CACHE_PAGES {
            return Err(Error::MemoryTooSmall.into());
        }
        Ok(())
    }

    pub(crate) fn page_count(&self) -> u32 {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Writes a new page at the end of the file. The page is not made
    /// resident.
    pub(crate) fn new_page(&self, init: &[u8]) -> anyhow::Result<Pgno> {
        let pgno = self.page_count.fetch_add(1, Ordering::SeqCst) + 1;
        let pgno = Pgno::new(pgno).ok_or_else(|| anyhow!("page number overflow"))?;
        self.cache.source().write_page(pgno, init)?;
        log::trace!("new page pgno={pgno:?}");
        Ok(pgno)
    }

    /// Pins the page and returns it. Every call must be paired with
    /// [`Pager::release`]; prefer [`Pager::read`] which does it on drop.
    pub(crate) fn get(&self, pgno: Pgno) -> anyhow::Result<Arc<Page>> {
        self.cache.get(pgno)
    }

    pub(crate) fn release(&self, pgno: Pgno) -> anyhow::Result<()> {
        self.cache.release(pgno)
    }

    pub(crate) fn read(&self, pgno: Pgno) -> anyhow::Result<PageRef<'_>> {
        let page = self.get(pgno)?;
        Ok(PageRef { pager: self, page })
    }

    pub(crate) fn flush(&self, page: &Page) -> anyhow::Result<()> {
        page.take_dirty();
        if let Err(err) = self.cache.source().write_page(page.pgno(), &page.snapshot()) {
            page.set_dirty();
            return Err(err);
        }
        Ok(())
    }

    /// Cuts the file down to `page_count` pages. Only used by recovery before
    /// any page above the limit is resident.
    pub(crate) fn truncate(&self, page_count: u32) -> anyhow::Result<()> {
        self.cache.source().truncate(page_count)?;
        self.page_count.store(page_count, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn close(&self) -> anyhow::Result<()> {
        self.cache.close()?;
        self.cache.source().sync()
    }
}

/// A pinned page, released on drop.
pub(crate) struct PageRef<'a> {
    pager: &'a Pager,
    page: Arc<Page>,
}

impl Deref for PageRef<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.pager.release(self.page.pgno()) {
            fatal("cannot release page", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::page::init_data_page;

    #[test]
    fn test_pager() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let pager = Pager::create(&path, MIN_CACHE_PAGES).unwrap();
        assert_eq!(0, pager.page_count());
        let p1 = pager.new_page(&init_data_page()).unwrap();
        let p2 = pager.new_page(&init_data_page()).unwrap();
        assert_eq!(1, p1.get());
        assert_eq!(2, p2.get());
        assert_eq!(2 * PAGE_SIZE as u64, std::fs::metadata(&path).unwrap().len());

        {
            let page = pager.read(p2).unwrap();
            page.append(b"some record").unwrap();
            assert!(page.is_dirty());
        }
        // released pages are written back right away
        assert_eq!(2 + 11, pager.read(p2).unwrap().fso());
        pager.close().unwrap();
        drop(pager);

        let pager = Pager::open(&path, MIN_CACHE_PAGES).unwrap();
        assert_eq!(2, pager.page_count());
        let page = pager.read(p2).unwrap();
        assert_eq!(b"some record".to_vec(), page.read_range(2..13));
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_pager_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let pager = Pager::create(&path, MIN_CACHE_PAGES).unwrap();
        for _ in 0..5 {
            pager.new_page(&init_data_page()).unwrap();
        }
        pager.truncate(3).unwrap();
        assert_eq!(3, pager.page_count());
        assert_eq!(3 * PAGE_SIZE as u64, std::fs::metadata(&path).unwrap().len());
        assert_eq!(4, pager.new_page(&init_data_page()).unwrap().get());
    }

    #[test]
    fn test_pager_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let pager = Pager::create(&path, MIN_CACHE_PAGES).unwrap();
        let pgno = pager.new_page(&init_data_page()).unwrap();
        let page = pager.get(pgno).unwrap();
        page.append(b"abc").unwrap();
        pager.flush(&page).unwrap();
        assert!(!page.is_dirty());

        let mut buff = vec![0u8; PAGE_SIZE];
        pager.cache.source().read_page(pgno, &mut buff).unwrap();
        assert_eq!(b"abc", &buff[2..5]);
        pager.release(pgno).unwrap();
    }

    #[test]
    fn test_pager_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let err = Pager::create(&dir.path().join("test.db"), 9).err().unwrap();
        assert_eq!(Some(&Error::MemoryTooSmall), err.downcast_ref::<Error>());
    }
}
