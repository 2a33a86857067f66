use crate::id::{Pgno, Xid};
use crate::ledger::Ledger;
use crate::log::WalRecord;
use crate::pager::Pager;
use crate::store::mark_invalid;
use crate::wal::Wal;
use std::collections::BTreeMap;

/// Brings the data file back to a state consistent with the log: pages never
/// referenced by the log are cut off, finished transactions are redone and
/// transactions that were still running are undone and aborted.
pub(crate) fn recover(ledger: &Ledger, wal: &Wal, pager: &Pager) -> anyhow::Result<()> {
    log::debug!("recovery started");

    let max_pgno = find_max_pgno(wal)?;
    log::debug!(
        "truncating data file page_count={} max_pgno={max_pgno}",
        pager.page_count()
    );
    pager.truncate(max_pgno)?;

    redo(ledger, wal, pager)?;
    undo(ledger, wal, pager)?;

    log::debug!("recovery finished");
    Ok(())
}

fn find_max_pgno(wal: &Wal) -> anyhow::Result<u32> {
    let mut max_pgno = Pgno::FIRST.get();
    let mut iter = wal.iter();
    while let Some(data) = iter.next()? {
        let record = WalRecord::decode(&data)?;
        max_pgno = max_pgno.max(record.pgno()?.get());
    }
    Ok(max_pgno)
}

fn redo(ledger: &Ledger, wal: &Wal, pager: &Pager) -> anyhow::Result<()> {
    let mut redone = 0usize;
    let mut iter = wal.iter();
    while let Some(data) = iter.next()? {
        let record = WalRecord::decode(&data)?;
        if ledger.is_active(record.xid())? {
            continue;
        }

        let page = pager.read(record.pgno()?)?;
        match record {
            WalRecord::Insert { offset, raw, .. } => page.recover_insert(offset, raw)?,
            WalRecord::Update { uid, new_raw, .. } => {
                page.recover_update(uid.offset(), new_raw)?
            }
        }
        redone += 1;
    }
    log::debug!("redo finished records={redone}");
    Ok(())
}

fn undo(ledger: &Ledger, wal: &Wal, pager: &Pager) -> anyhow::Result<()> {
    let mut pending = BTreeMap::<Xid, Vec<Vec<u8>>>::new();
    let mut iter = wal.iter();
    while let Some(data) = iter.next()? {
        let xid = WalRecord::decode(&data)?.xid();
        if ledger.is_active(xid)? {
            pending.entry(xid).or_default().push(data);
        }
    }

    for (xid, records) in pending {
        log::debug!("undoing transaction xid={xid:?} records={}", records.len());
        for data in records.iter().rev() {
            undo_record(wal, pager, WalRecord::decode(data)?)?;
        }
        ledger.abort(xid)?;
    }
    Ok(())
}

/// Reverts one record. The compensation is logged first so that a later redo
/// pass replays the undo as well.
fn undo_record(wal: &Wal, pager: &Pager, record: WalRecord) -> anyhow::Result<()> {
    let page = pager.read(record.pgno()?)?;
    match record {
        WalRecord::Insert {
            xid,
            pgno,
            offset,
            raw,
        } => {
            let mut tombstone = raw.to_vec();
            mark_invalid(&mut tombstone);
            let compensation = WalRecord::Insert {
                xid,
                pgno,
                offset,
                raw: &tombstone,
            };
            wal.log(&compensation.encode())?;
            page.recover_insert(offset, &tombstone)?;
        }
        WalRecord::Update {
            xid,
            uid,
            old_raw,
            new_raw,
        } => {
            let compensation = WalRecord::Update {
                xid,
                uid,
                old_raw: new_raw,
                new_raw: old_raw,
            };
            wal.log(&compensation.encode())?;
            page.recover_update(uid.offset(), old_raw)?;
        }
    }
    Ok(())
}
