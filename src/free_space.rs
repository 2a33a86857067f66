use crate::id::Pgno;
use crate::pager::PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::VecDeque;

const INTERVALS: usize = 40;
const THRESHOLD: usize = PAGE_SIZE / INTERVALS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageInfo {
    pub(crate) pgno: Pgno,
    pub(crate) free_space: usize,
}

/// Pages bucketed by how much room they have left. A page taken out by
/// `select` is owned by the caller until it is `add`ed back.
pub(crate) struct FreeSpaceIndex {
    buckets: Mutex<Vec<VecDeque<PageInfo>>>,
}

impl FreeSpaceIndex {
    pub(crate) fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![VecDeque::new(); INTERVALS + 1]),
        }
    }

    pub(crate) fn add(&self, pgno: Pgno, free_space: usize) {
        let bucket = (free_space / THRESHOLD).min(INTERVALS);
        self.buckets.lock()[bucket].push_back(PageInfo { pgno, free_space });
    }

    pub(crate) fn select(&self, space: usize) -> Option<PageInfo> {
        let mut bucket = space / THRESHOLD;
        // the bucket of `space` itself may hold pages with slightly less room
        if bucket < INTERVALS {
            bucket += 1;
        }

        // the top bucket is open ended, its pages are checked one by one and
        // the ones that are too small stay where they are
        let mut buckets = self.buckets.lock();
        buckets[bucket..].iter_mut().find_map(|pages| {
            let i = pages.iter().position(|info| info.free_space >= space)?;
            pages.remove(i)
        })
    }
}
