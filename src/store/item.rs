use crate::bins::SliceExt;
use crate::error::fatal;
use crate::id::{Uid, Xid};
use crate::log::WalRecord;
use crate::pager::{Page, PAGE_SIZE};
use crate::store::DataStore;
use anyhow::anyhow;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::ops::Range;
use std::sync::Arc;

// [valid:1][size:2][data]
const ITEM_VALID_INDEX: usize = 0;
const ITEM_SIZE_RANGE: Range<usize> = 1..3;
pub(crate) const ITEM_HEADER_SIZE: usize = 3;

const ITEM_VALID: u8 = 0;
const ITEM_INVALID: u8 = 1;

pub(crate) fn wrap_item_raw(data: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; ITEM_HEADER_SIZE + data.len()];
    raw[ITEM_VALID_INDEX] = ITEM_VALID;
    raw[ITEM_SIZE_RANGE].put_u16(data.len() as u16);
    raw[ITEM_HEADER_SIZE..].copy_from_slice(data);
    raw
}

/// Turns an item raw into the raw of a deleted slot.
pub(crate) fn mark_invalid(raw: &mut [u8]) {
    raw[ITEM_VALID_INDEX] = ITEM_INVALID;
}

/// A record living inside a pinned page.
pub(crate) struct DataItem {
    uid: Uid,
    page: Arc<Page>,
    offset: usize,
    size: usize,
    lock: RwLock<()>,
}

impl DataItem {
    pub(crate) fn parse(uid: Uid, page: Arc<Page>) -> anyhow::Result<Self> {
        let offset = uid.offset() as usize;
        if offset + ITEM_HEADER_SIZE > PAGE_SIZE {
            return Err(anyhow!("item {uid:?} starts outside of its page"));
        }
        let size = page.read(|buff| buff[offset + ITEM_SIZE_RANGE.start..].read_u16()) as usize;
        if offset + ITEM_HEADER_SIZE + size > PAGE_SIZE {
            return Err(anyhow!("item {uid:?} of size {size} overflows its page"));
        }
        Ok(Self {
            uid,
            page,
            offset,
            size,
            lock: RwLock::new(()),
        })
    }

    pub(crate) fn page(&self) -> &Page {
        &self.page
    }

    fn raw_range(&self) -> Range<usize> {
        self.offset..self.offset + ITEM_HEADER_SIZE + self.size
    }

    fn data_range(&self) -> Range<usize> {
        self.offset + ITEM_HEADER_SIZE..self.offset + ITEM_HEADER_SIZE + self.size
    }

    pub(crate) fn is_valid(&self) -> bool {
        let _guard = self.lock.read();
        self.page.read(|buff| buff[self.offset + ITEM_VALID_INDEX]) == ITEM_VALID
    }
}

/// A referenced data item. The reference is given back to the store on drop.
pub(crate) struct DataItemRef<'a> {
    pub(super) store: &'a DataStore,
    pub(super) item: Arc<DataItem>,
}

impl<'a> DataItemRef<'a> {
    pub(crate) fn uid(&self) -> Uid {
        self.item.uid
    }

    pub(crate) fn data(&self) -> Vec<u8> {
        self.read(|data| data.to_vec())
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let _guard = self.item.lock.read();
        self.item.page.read(|buff| f(&buff[self.item.data_range()]))
    }

    /// Starts an in-place mutation. The item stays exclusively locked until
    /// the returned guard is finished with `after` or `un_before`, or dropped
    /// which behaves like `un_before`.
    pub(crate) fn before(&self) -> DataItemWrite<'_> {
        let guard = self.item.lock.write();
        self.item.page.set_dirty();
        let old_raw = self.item.page.read_range(self.item.raw_range());
        DataItemWrite {
            store: self.store,
            item: &self.item,
            old_raw,
            finished: false,
            _guard: guard,
        }
    }
}

impl Drop for DataItemRef<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.release(self.item.uid) {
            fatal("cannot release data item", err);
        }
    }
}

pub(crate) struct DataItemWrite<'a> {
    store: &'a DataStore,
    item: &'a DataItem,
    old_raw: Vec<u8>,
    finished: bool,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl DataItemWrite<'_> {
    pub(crate) fn data(&self) -> Vec<u8> {
        self.item.page.read_range(self.item.data_range())
    }

    /// Overwrites part of the payload. `offset` is relative to the payload.
    pub(crate) fn write(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.item.size,
            "write of {} bytes at {offset} overflows item of size {}",
            bytes.len(),
            self.item.size
        );
        self.item
            .page
            .write_at(self.item.data_range().start + offset, bytes);
    }

    /// Logs the mutation and releases the item.
    pub(crate) fn after(mut self, xid: Xid) -> anyhow::Result<()> {
        let new_raw = self.item.page.read_range(self.item.raw_range());
        let record = WalRecord::Update {
            xid,
            uid: self.item.uid,
            old_raw: &self.old_raw,
            new_raw: &new_raw,
        };
        self.store.wal.log(&record.encode())?;
        self.finished = true;
        Ok(())
    }

    /// Restores the bytes captured by `before` without logging anything.
    pub(crate) fn un_before(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if !self.finished {
            self.item.page.write_at(self.item.offset, &self.old_raw);
            self.finished = true;
        }
    }
}

impl Drop for DataItemWrite<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}
