use crate::bins::SliceExt;
use crate::error::Error;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

// the file starts with the running checksum of every complete record
const WAL_HEADER_SIZE: u64 = 4;
// [size:4][checksum:4][data]
const WAL_RECORD_HEADER_SIZE: usize = 8;

/// Append-only write-ahead log.
pub(crate) struct Wal {
    inner: Mutex<WalInner>,
}

struct WalInner {
    f: File,
    file_size: u64,
    // full crc64 state, the file stores its low 32 bits
    xchecksum: u64,
}

fn record_checksum(data: &[u8]) -> u32 {
    crc64::crc64(0, data) as u32
}

impl Wal {
    pub(crate) fn create(path: &Path) -> anyhow::Result<Self> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        f.write_all(&0u32.to_be_bytes())?;
        f.sync_all()?;
        Ok(Self {
            inner: Mutex::new(WalInner {
                f,
                file_size: WAL_HEADER_SIZE,
                xchecksum: 0,
            }),
        })
    }

    /// Opens the log and cuts off everything after the last record boundary
    /// that agrees with the stored file checksum.
    pub(crate) fn open(path: &Path) -> anyhow::Result<Self> {
        let mut f = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = f.metadata()?.len();
        if file_size < WAL_HEADER_SIZE {
            log::error!("log file is shorter than its header size={file_size}");
            return Err(Error::BadLogFile.into());
        }

        let mut header = [0u8; WAL_HEADER_SIZE as usize];
        f.seek(SeekFrom::Start(0))?;
        f.read_exact(&mut header)?;
        let stored = header.read_u32();

        let mut state = 0u64;
        let mut position = WAL_HEADER_SIZE;
        let mut good = (stored == 0).then_some((position, state));
        let mut n_records = 0usize;
        while let Some(record) = read_record(&mut f, position, file_size)? {
            state = crc64::crc64(state, &record);
            position += record.len() as u64;
            n_records += 1;
            if state as u32 == stored {
                good = Some((position, state));
            }
        }

        let Some((good_size, xchecksum)) = good else {
            log::error!("log checksum mismatch stored={stored:#x} records={n_records}");
            return Err(Error::BadLogFile.into());
        };
        if good_size < file_size {
            log::warn!("truncating bad log tail from {file_size} to {good_size}");
            f.set_len(good_size)?;
            f.sync_all()?;
        }

        log::debug!("log opened path={path:?} size={good_size}");
        Ok(Self {
            inner: Mutex::new(WalInner {
                f,
                file_size: good_size,
                xchecksum,
            }),
        })
    }

    pub(crate) fn log(&self, data: &[u8]) -> anyhow::Result<()> {
        let size = u32::try_from(data.len()).map_err(|_| anyhow!("log record too large"))?;
        let mut record = vec![0u8; WAL_RECORD_HEADER_SIZE + data.len()];
        record[0..4].put_u32(size);
        record[4..8].put_u32(record_checksum(data));
        record[WAL_RECORD_HEADER_SIZE..].copy_from_slice(data);

        let mut inner = self.inner.lock();
        let end = inner.file_size;
        inner.f.seek(SeekFrom::Start(end))?;
        inner.f.write_all(&record)?;
        inner.f.sync_data()?;
        inner.file_size += record.len() as u64;

        inner.xchecksum = crc64::crc64(inner.xchecksum, &record);
        let header = (inner.xchecksum as u32).to_be_bytes();
        inner.f.seek(SeekFrom::Start(0))?;
        inner.f.write_all(&header)?;
        inner.f.sync_data()?;

        log::trace!("log appended size={size} end={}", inner.file_size);
        Ok(())
    }

    pub(crate) fn iter(&self) -> WalIterator<'_> {
        WalIterator {
            wal: self,
            position: WAL_HEADER_SIZE,
        }
    }

    pub(crate) fn close(&self) -> anyhow::Result<()> {
        self.inner.lock().f.sync_all()?;
        Ok(())
    }
}

/// Reads the complete record at `position`, header included. Returns `None` at
/// the end of the file and at the first incomplete or corrupted record.
fn read_record(f: &mut File, position: u64, file_size: u64) -> anyhow::Result<Option<Vec<u8>>> {
    if position + WAL_RECORD_HEADER_SIZE as u64 > file_size {
        return Ok(None);
    }
    let mut header = [0u8; WAL_RECORD_HEADER_SIZE];
    f.seek(SeekFrom::Start(position))?;
    f.read_exact(&mut header)?;

    let size = header[0..4].read_u32() as u64;
    if position + WAL_RECORD_HEADER_SIZE as u64 + size > file_size {
        return Ok(None);
    }

    let mut record = vec![0u8; WAL_RECORD_HEADER_SIZE + size as usize];
    record[..WAL_RECORD_HEADER_SIZE].copy_from_slice(&header);
    f.read_exact(&mut record[WAL_RECORD_HEADER_SIZE..])?;
    if record_checksum(&record[WAL_RECORD_HEADER_SIZE..]) != header[4..8].read_u32() {
        return Ok(None);
    }
    Ok(Some(record))
}

/// Single pass over the record payloads in append order.
pub(crate) struct WalIterator<'a> {
    wal: &'a Wal,
    position: u64,
}

impl WalIterator<'_> {
    pub(crate) fn next(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        let mut inner = self.wal.inner.lock();
        let file_size = inner.file_size;
        let Some(mut record) = read_record(&mut inner.f, self.position, file_size)? else {
            return Ok(None);
        };
        self.position += record.len() as u64;
        Ok(Some(record.split_off(WAL_RECORD_HEADER_SIZE)))
    }

    pub(crate) fn rewind(&mut self) {
        self.position = WAL_HEADER_SIZE;
    }
}
