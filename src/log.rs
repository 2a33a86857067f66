use crate::bins::SliceExt;
use crate::id::{Pgno, Uid, Xid};
use anyhow::anyhow;

const WAL_RECORD_INSERT_KIND: u8 = 0;
const WAL_RECORD_UPDATE_KIND: u8 = 1;

// insert: [kind:1][xid:8][pgno:4][offset:2][raw]
const INSERT_HEADER_SIZE: usize = 1 + 8 + 4 + 2;
// update: [kind:1][xid:8][uid:8][old raw][new raw], both raws have the same size
const UPDATE_HEADER_SIZE: usize = 1 + 8 + 8;

/// Physical redo/undo record stored in the write-ahead log.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WalRecord<'a> {
    Insert {
        xid: Xid,
        pgno: Pgno,
        offset: u16,
        raw: &'a [u8],
    },
    Update {
        xid: Xid,
        uid: Uid,
        old_raw: &'a [u8],
        new_raw: &'a [u8],
    },
}

impl<'a> WalRecord<'a> {
    pub(crate) fn xid(&self) -> Xid {
        match self {
            Self::Insert { xid, .. } | Self::Update { xid, .. } => *xid,
        }
    }

    pub(crate) fn pgno(&self) -> anyhow::Result<Pgno> {
        match self {
            Self::Insert { pgno, .. } => Ok(*pgno),
            Self::Update { uid, .. } => uid.pgno(),
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        match self {
            Self::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => {
                let mut buff = vec![0u8; INSERT_HEADER_SIZE + raw.len()];
                buff[0] = WAL_RECORD_INSERT_KIND;
                buff[1..9].put_u64(xid.get());
                buff[9..13].put_u32(pgno.get());
                buff[13..15].put_u16(*offset);
                buff[INSERT_HEADER_SIZE..].copy_from_slice(raw);
                buff
            }
            Self::Update {
                xid,
                uid,
                old_raw,
                new_raw,
            } => {
                assert_eq!(
                    old_raw.len(),
                    new_raw.len(),
                    "update must not change the record size"
                );
                let mut buff = vec![0u8; UPDATE_HEADER_SIZE + old_raw.len() * 2];
                buff[0] = WAL_RECORD_UPDATE_KIND;
                buff[1..9].put_u64(xid.get());
                buff[9..17].put_u64(uid.get());
                let (old, new) = buff[UPDATE_HEADER_SIZE..].split_at_mut(old_raw.len());
                old.copy_from_slice(old_raw);
                new.copy_from_slice(new_raw);
                buff
            }
        }
    }

    pub(crate) fn decode(buff: &'a [u8]) -> anyhow::Result<Self> {
        let Some(&kind) = buff.first() else {
            return Err(anyhow!("empty wal record"));
        };

        match kind {
            WAL_RECORD_INSERT_KIND => {
                if buff.len() < INSERT_HEADER_SIZE {
                    return Err(anyhow!("insert record is too short"));
                }
                let pgno = Pgno::new(buff[9..13].read_u32())
                    .ok_or_else(|| anyhow!("insert record points to page 0"))?;
                Ok(Self::Insert {
                    xid: Xid::new(buff[1..9].read_u64()),
                    pgno,
                    offset: buff[13..15].read_u16(),
                    raw: &buff[INSERT_HEADER_SIZE..],
                })
            }
            WAL_RECORD_UPDATE_KIND => {
                if buff.len() < UPDATE_HEADER_SIZE || (buff.len() - UPDATE_HEADER_SIZE) % 2 != 0 {
                    return Err(anyhow!("malformed update record of size {}", buff.len()));
                }
                let half = (buff.len() - UPDATE_HEADER_SIZE) / 2;
                let (old_raw, new_raw) = buff[UPDATE_HEADER_SIZE..].split_at(half);
                Ok(Self::Update {
                    xid: Xid::new(buff[1..9].read_u64()),
                    uid: Uid::from_raw(buff[9..17].read_u64()),
                    old_raw,
                    new_raw,
                })
            }
            _ => Err(anyhow!("invalid wal record kind {kind}")),
        }
    }
}
