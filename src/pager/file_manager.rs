use crate::cache::CacheSource;
use crate::file_lock::FileLock;
use crate::id::Pgno;
use crate::pager::page::{Page, PAGE_SIZE};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Owns the data file. All physical page I/O goes through the single file
/// mutex.
pub(crate) struct FileManager {
    f: Mutex<File>,
}

impl FileManager {
    pub(crate) fn create(path: &Path) -> anyhow::Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?
            .try_lock()?;
        Ok(Self { f: Mutex::new(f) })
    }

    pub(crate) fn open(path: &Path) -> anyhow::Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?
            .try_lock()?;
        if !f.metadata()?.is_file() {
            return Err(anyhow!("db file is not a regular file"));
        }
        Ok(Self { f: Mutex::new(f) })
    }

    pub(crate) fn file_len(&self) -> anyhow::Result<u64> {
        Ok(self.f.lock().metadata()?.len())
    }

    pub(crate) fn read_page(&self, pgno: Pgno, buff: &mut [u8]) -> anyhow::Result<()> {
        assert_eq!(PAGE_SIZE, buff.len());
        let mut f = self.f.lock();
        f.seek(SeekFrom::Start(pgno.file_offset(PAGE_SIZE)))?;

        // bytes past the end of the file read as zero
        let mut filled = 0;
        while filled < buff.len() {
            let n = f.read(&mut buff[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buff[filled..].fill(0);
        Ok(())
    }

    pub(crate) fn write_page(&self, pgno: Pgno, buff: &[u8]) -> anyhow::Result<()> {
        assert_eq!(PAGE_SIZE, buff.len());
        let mut f = self.f.lock();
        f.seek(SeekFrom::Start(pgno.file_offset(PAGE_SIZE)))?;
        f.write_all(buff)?;
        f.sync_data()?;
        Ok(())
    }

    pub(crate) fn truncate(&self, page_count: u32) -> anyhow::Result<()> {
        let f = self.f.lock();
        f.set_len(page_count as u64 * PAGE_SIZE as u64)?;
        f.sync_all()?;
        Ok(())
    }

    pub(crate) fn sync(&self) -> anyhow::Result<()> {
        self.f.lock().sync_all()?;
        Ok(())
    }
}

impl CacheSource for FileManager {
    type Key = Pgno;
    type Value = Page;

    fn load(&self, pgno: Pgno) -> anyhow::Result<Page> {
        let mut buff = vec![0u8; PAGE_SIZE].into_boxed_slice();
        self.read_page(pgno, &mut buff)?;
        Ok(Page::new(pgno, buff))
    }

    fn evict(&self, pgno: Pgno, page: &Page) -> anyhow::Result<()> {
        if page.take_dirty() {
            if let Err(err) = self.write_page(pgno, &page.snapshot()) {
                page.set_dirty();
                return Err(err);
            }
        }
        Ok(())
    }
}
