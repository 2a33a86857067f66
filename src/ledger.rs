use crate::error::Error;
use crate::id::Xid;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const LEDGER_HEADER_SIZE: u64 = 8;

const XID_STATUS_ACTIVE: u8 = 0;
const XID_STATUS_COMMITTED: u8 = 1;
const XID_STATUS_ABORTED: u8 = 2;

/// Persistent status of every transaction: an 8 byte counter of allocated
/// xids followed by one status byte per xid.
pub(crate) struct Ledger {
    inner: Mutex<LedgerInner>,
}

struct LedgerInner {
    f: File,
    counter: u64,
}

impl Ledger {
    pub(crate) fn create(path: &Path) -> anyhow::Result<Self> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        f.write_all(&0u64.to_be_bytes())?;
        f.sync_all()?;
        log::debug!("ledger created path={path:?}");
        Ok(Self {
            inner: Mutex::new(LedgerInner { f, counter: 0 }),
        })
    }

    pub(crate) fn open(path: &Path) -> anyhow::Result<Self> {
        let mut f = OpenOptions::new().read(true).write(true).open(path)?;

        let len = f.metadata()?.len();
        if len < LEDGER_HEADER_SIZE {
            return Err(Error::BadLedgerFile.into());
        }
        let mut buff = [0u8; 8];
        f.seek(SeekFrom::Start(0))?;
        f.read_exact(&mut buff)?;
        let counter = u64::from_be_bytes(buff);
        if len != LEDGER_HEADER_SIZE + counter {
            log::error!("ledger length mismatch len={len} counter={counter}");
            return Err(Error::BadLedgerFile.into());
        }

        log::debug!("ledger opened path={path:?} counter={counter}");
        Ok(Self {
            inner: Mutex::new(LedgerInner { f, counter }),
        })
    }

    pub(crate) fn begin(&self) -> anyhow::Result<Xid> {
        let mut inner = self.inner.lock();
        let xid = Xid::new(inner.counter).next();
        inner.write_status(xid, XID_STATUS_ACTIVE)?;

        inner.f.seek(SeekFrom::Start(0))?;
        inner.f.write_all(&xid.to_be_bytes())?;
        inner.f.sync_data()?;
        inner.counter = xid.get();
        Ok(xid)
    }

    pub(crate) fn commit(&self, xid: Xid) -> anyhow::Result<()> {
        self.inner.lock().write_status(xid, XID_STATUS_COMMITTED)
    }

    pub(crate) fn abort(&self, xid: Xid) -> anyhow::Result<()> {
        self.inner.lock().write_status(xid, XID_STATUS_ABORTED)
    }

    pub(crate) fn is_active(&self, xid: Xid) -> anyhow::Result<bool> {
        if xid.is_super() {
            return Ok(false);
        }
        Ok(self.inner.lock().read_status(xid)? == XID_STATUS_ACTIVE)
    }

    pub(crate) fn is_committed(&self, xid: Xid) -> anyhow::Result<bool> {
        if xid.is_super() {
            return Ok(true);
        }
        Ok(self.inner.lock().read_status(xid)? == XID_STATUS_COMMITTED)
    }

    pub(crate) fn is_aborted(&self, xid: Xid) -> anyhow::Result<bool> {
        if xid.is_super() {
            return Ok(false);
        }
        Ok(self.inner.lock().read_status(xid)? == XID_STATUS_ABORTED)
    }

    pub(crate) fn close(self) -> anyhow::Result<()> {
        let inner = self.inner.into_inner();
        inner.f.sync_all()?;
        Ok(())
    }
}

impl LedgerInner {
    fn status_offset(xid: Xid) -> u64 {
        LEDGER_HEADER_SIZE + xid.get() - 1
    }

    fn write_status(&mut self, xid: Xid, status: u8) -> anyhow::Result<()> {
        assert!(!xid.is_super(), "the super transaction has no status slot");
        self.f.seek(SeekFrom::Start(Self::status_offset(xid)))?;
        self.f.write_all(&[status])?;
        self.f.sync_data()?;
        Ok(())
    }

    fn read_status(&mut self, xid: Xid) -> anyhow::Result<u8> {
        if xid.get() > self.counter {
            return Err(anyhow::anyhow!("xid {xid:?} was never allocated"));
        }
        let mut buff = [0u8; 1];
        self.f.seek(SeekFrom::Start(Self::status_offset(xid)))?;
        self.f.read_exact(&mut buff)?;
        Ok(buff[0])
    }
}
