use crate::bins::SliceExt;
use crate::id::Pgno;
use parking_lot::Mutex;
use rand::RngCore;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) const PAGE_SIZE: usize = 8192;

/// A resident copy of one page of the data file.
pub(crate) struct Page {
    pgno: Pgno,
    buffer: Mutex<Box<[u8]>>,
    dirty: AtomicBool,
}

impl Page {
    pub(crate) fn new(pgno: Pgno, buffer: Box<[u8]>) -> Self {
        assert_eq!(PAGE_SIZE, buffer.len(), "page buffer must be exactly one page");
        Self {
            pgno,
            buffer: Mutex::new(buffer),
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn pgno(&self) -> Pgno {
        self.pgno
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Clears the dirty flag and returns whether it was set.
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.buffer.lock())
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut buffer = self.buffer.lock();
        self.set_dirty();
        f(&mut buffer)
    }

    pub(crate) fn read_range(&self, range: Range<usize>) -> Vec<u8> {
        self.read(|buff| buff[range].to_vec())
    }

    pub(crate) fn write_at(&self, offset: usize, bytes: &[u8]) {
        self.write(|buff| buff[offset..offset + bytes.len()].copy_from_slice(bytes));
    }

    pub(crate) fn snapshot(&self) -> Box<[u8]> {
        self.read(|buff| buff.into())
    }
}

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

const fn range_size(range: Range<usize>) -> usize {
    range.end - range.start
}

// Page 1 carries the validity check bytes. The first slot is rewritten on every
// open, the second one receives a copy of the first on clean close.
const FIRST_PAGE_VC_OPEN_RANGE: Range<usize> = 100..108;
const FIRST_PAGE_VC_CLOSE_RANGE: Range<usize> = 108..116;

const_assert!(range_size(FIRST_PAGE_VC_OPEN_RANGE) == range_size(FIRST_PAGE_VC_CLOSE_RANGE));
const_assert!(FIRST_PAGE_VC_CLOSE_RANGE.end <= PAGE_SIZE);

pub(crate) fn init_first_page() -> Box<[u8]> {
    let mut buff = vec![0u8; PAGE_SIZE].into_boxed_slice();
    rand::thread_rng().fill_bytes(&mut buff[FIRST_PAGE_VC_OPEN_RANGE]);
    buff
}

impl Page {
    pub(crate) fn set_vc_open(&self) {
        self.write(|buff| rand::thread_rng().fill_bytes(&mut buff[FIRST_PAGE_VC_OPEN_RANGE]));
    }

    pub(crate) fn set_vc_close(&self) {
        self.write(|buff| buff.copy_within(FIRST_PAGE_VC_OPEN_RANGE, FIRST_PAGE_VC_CLOSE_RANGE.start));
    }

    /// Whether the last session closed the database cleanly.
    pub(crate) fn check_vc(&self) -> bool {
        self.read(|buff| buff[FIRST_PAGE_VC_OPEN_RANGE] == buff[FIRST_PAGE_VC_CLOSE_RANGE])
    }
}

// Every other page starts with the offset of its first free byte. Records are
// appended after it and never move.
const DATA_PAGE_FSO_RANGE: Range<usize> = 0..2;
pub(crate) const DATA_PAGE_HEADER_SIZE: usize = 2;
pub(crate) const MAX_FREE_SPACE: usize = PAGE_SIZE - DATA_PAGE_HEADER_SIZE;

const_assert!(DATA_PAGE_FSO_RANGE.end == DATA_PAGE_HEADER_SIZE);
const_assert!(PAGE_SIZE <= u16::MAX as usize + 1);

pub(crate) fn init_data_page() -> Box<[u8]> {
    let mut buff = vec![0u8; PAGE_SIZE].into_boxed_slice();
    buff[DATA_PAGE_FSO_RANGE].put_u16(DATA_PAGE_HEADER_SIZE as u16);
    buff
}

impl Page {
    pub(crate) fn fso(&self) -> usize {
        self.read(|buff| buff[DATA_PAGE_FSO_RANGE].read_u16() as usize)
    }

    pub(crate) fn free_space(&self) -> usize {
        PAGE_SIZE - self.fso()
    }

    /// Appends `raw` at the free space offset and returns where it landed.
    pub(crate) fn append(&self, raw: &[u8]) -> anyhow::Result<u16> {
        self.write(|buff| {
            let fso = buff[DATA_PAGE_FSO_RANGE].read_u16() as usize;
            if fso + raw.len() > PAGE_SIZE {
                return Err(anyhow::anyhow!(
                    "page {:?} has no room for {} bytes at {fso}",
                    self.pgno,
                    raw.len()
                ));
            }
            buff[fso..fso + raw.len()].copy_from_slice(raw);
            buff[DATA_PAGE_FSO_RANGE].put_u16((fso + raw.len()) as u16);
            Ok(fso as u16)
        })
    }

    /// Rewrites an inserted record and moves the free space offset past it if
    /// needed.
    pub(crate) fn recover_insert(&self, offset: u16, raw: &[u8]) -> anyhow::Result<()> {
        let range = self.recovered_range(offset, raw)?;
        self.write(|buff| {
            buff[range.clone()].copy_from_slice(raw);
            let fso = buff[DATA_PAGE_FSO_RANGE].read_u16() as usize;
            if range.end > fso {
                buff[DATA_PAGE_FSO_RANGE].put_u16(range.end as u16);
            }
        });
        Ok(())
    }

    pub(crate) fn recover_update(&self, offset: u16, raw: &[u8]) -> anyhow::Result<()> {
        let range = self.recovered_range(offset, raw)?;
        self.write_at(range.start, raw);
        Ok(())
    }

    fn recovered_range(&self, offset: u16, raw: &[u8]) -> anyhow::Result<Range<usize>> {
        let start = offset as usize;
        if start < DATA_PAGE_HEADER_SIZE || start + raw.len() > PAGE_SIZE {
            return Err(anyhow::anyhow!(
                "logged record of {} bytes at {offset} does not fit page {:?}",
                raw.len(),
                self.pgno
            ));
        }
        Ok(start..start + raw.len())
    }
}
