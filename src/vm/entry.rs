use crate::bins::SliceExt;
use crate::id::{Uid, Xid};
use crate::store::{DataItemRef, DataItemWrite, DataStore};
use std::ops::Range;

// [xmin:8][xmax:8][data]
const ENTRY_XMIN_RANGE: Range<usize> = 0..8;
const ENTRY_XMAX_RANGE: Range<usize> = 8..16;
const ENTRY_HEADER_SIZE: usize = 16;

pub(crate) fn wrap_entry_raw(xid: Xid, data: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; ENTRY_HEADER_SIZE + data.len()];
    raw[ENTRY_XMIN_RANGE].put_u64(xid.get());
    raw[ENTRY_XMAX_RANGE].put_u64(Xid::SUPER.get());
    raw[ENTRY_HEADER_SIZE..].copy_from_slice(data);
    raw
}

/// Creator and deleter of a version. A deleter of 0 means alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stamp {
    pub(crate) xmin: Xid,
    pub(crate) xmax: Xid,
}

impl Stamp {
    fn decode(raw: &[u8]) -> Self {
        Self {
            xmin: Xid::new(raw[ENTRY_XMIN_RANGE].read_u64()),
            xmax: Xid::new(raw[ENTRY_XMAX_RANGE].read_u64()),
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        !self.xmax.is_super()
    }
}

/// One version of a row, backed by a single data item.
pub(crate) struct Entry<'a> {
    item: DataItemRef<'a>,
}

impl<'a> Entry<'a> {
    pub(crate) fn load(store: &'a DataStore, uid: Uid) -> anyhow::Result<Option<Self>> {
        Ok(store.read(uid)?.map(|item| Self { item }))
    }

    pub(crate) fn stamp(&self) -> anyhow::Result<Stamp> {
        self.item.read(|raw| {
            if raw.len() < ENTRY_HEADER_SIZE {
                return Err(anyhow::anyhow!("{:?} is not an entry", self.item.uid()));
            }
            Ok(Stamp::decode(raw))
        })
    }

    pub(crate) fn data(&self) -> Vec<u8> {
        self.item.read(|raw| raw[ENTRY_HEADER_SIZE..].to_vec())
    }

    /// Locks the entry for changing its deleter.
    pub(crate) fn before(&self) -> EntryWrite<'_> {
        EntryWrite {
            inner: self.item.before(),
        }
    }
}

pub(crate) struct EntryWrite<'a> {
    inner: DataItemWrite<'a>,
}

impl EntryWrite<'_> {
    pub(crate) fn stamp(&self) -> Stamp {
        Stamp::decode(&self.inner.data())
    }

    pub(crate) fn set_xmax(mut self, xid: Xid) -> anyhow::Result<()> {
        self.inner.write(ENTRY_XMAX_RANGE.start, &xid.to_be_bytes());
        self.inner.after(xid)
    }

    pub(crate) fn cancel(self) {
        self.inner.un_before();
    }
}
