use crate::bins::SliceExt;
use crate::id::{Uid, Xid};
use crate::store::{DataItemRef, DataStore};
use anyhow::anyhow;
use std::ops::Range;

pub(crate) const BALANCE: usize = 32;

// [leaf:1][key count:2][sibling:8] followed by (son:8, key:8) pairs
const NODE_LEAF_INDEX: usize = 0;
const NODE_KEY_COUNT_RANGE: Range<usize> = 1..3;
const NODE_SIBLING_RANGE: Range<usize> = 3..11;
const NODE_HEADER_SIZE: usize = 11;
const NODE_PAIR_SIZE: usize = 16;
const NODE_PAIRS: usize = BALANCE * 2 + 2;
pub(crate) const NODE_SIZE: usize = NODE_HEADER_SIZE + NODE_PAIR_SIZE * NODE_PAIRS;

/// Raw bytes of a node, edited in memory and written back as a whole.
pub(crate) struct NodeBuf(Vec<u8>);

impl NodeBuf {
    pub(crate) fn nil_root() -> Self {
        let mut buf = Self(vec![0u8; NODE_SIZE]);
        buf.set_leaf(true);
        buf
    }

    /// Root over two children where everything below `key` lives in `left`.
    pub(crate) fn root(left: Uid, right: Uid, key: u64) -> Self {
        let mut buf = Self(vec![0u8; NODE_SIZE]);
        buf.set_leaf(false);
        buf.set_key_count(2);
        buf.set_son(0, left);
        buf.set_key(0, key);
        buf.set_son(1, right);
        buf.set_key(1, u64::MAX);
        buf
    }

    fn from_raw(raw: Vec<u8>) -> anyhow::Result<Self> {
        if raw.len() != NODE_SIZE {
            return Err(anyhow!("item of size {} is not a tree node", raw.len()));
        }
        Ok(Self(raw))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.0[NODE_LEAF_INDEX] == 1
    }

    fn set_leaf(&mut self, leaf: bool) {
        self.0[NODE_LEAF_INDEX] = leaf as u8;
    }

    pub(crate) fn key_count(&self) -> usize {
        self.0[NODE_KEY_COUNT_RANGE].read_u16() as usize
    }

    fn set_key_count(&mut self, n: usize) {
        self.0[NODE_KEY_COUNT_RANGE].put_u16(n as u16);
    }

    pub(crate) fn sibling(&self) -> Option<Uid> {
        let sibling = self.0[NODE_SIBLING_RANGE].read_u64();
        (sibling != 0).then(|| Uid::from_raw(sibling))
    }

    fn set_sibling(&mut self, sibling: Option<Uid>) {
        self.0[NODE_SIBLING_RANGE].put_u64(sibling.map_or(0, Uid::get));
    }

    fn pair_offset(i: usize) -> usize {
        NODE_HEADER_SIZE + i * NODE_PAIR_SIZE
    }

    pub(crate) fn son(&self, i: usize) -> Uid {
        Uid::from_raw(self.0[Self::pair_offset(i)..].read_u64())
    }

    fn set_son(&mut self, i: usize, son: Uid) {
        self.0[Self::pair_offset(i)..].put_u64(son.get());
    }

    pub(crate) fn key(&self, i: usize) -> u64 {
        self.0[Self::pair_offset(i) + 8..].read_u64()
    }

    fn set_key(&mut self, i: usize, key: u64) {
        self.0[Self::pair_offset(i) + 8..].put_u64(key);
    }

    // moves pairs kth.. one slot to the right
    fn shift_from(&mut self, kth: usize) {
        let n = self.key_count();
        if kth >= n {
            return;
        }
        let start = Self::pair_offset(kth);
        let end = Self::pair_offset(n);
        self.0.copy_within(start..end, start + NODE_PAIR_SIZE);
    }

    fn first_key_at_least(&self, key: u64) -> usize {
        let n = self.key_count();
        (0..n).find(|&i| self.key(i) >= key).unwrap_or(n)
    }

    /// Child to descend into for `key`, or `None` when `key` lies beyond this
    /// node and the search must continue at the sibling. A key equal to a
    /// separator goes right.
    pub(crate) fn search_next(&self, key: u64) -> Option<Uid> {
        (0..self.key_count())
            .find(|&i| key < self.key(i))
            .map(|i| self.son(i))
    }

    /// Collects the sons of keys in `lo..=hi`. The sibling is returned when
    /// the range may continue in it.
    pub(crate) fn leaf_search_range(&self, lo: u64, hi: u64) -> (Vec<Uid>, Option<Uid>) {
        let n = self.key_count();
        let mut kth = self.first_key_at_least(lo);
        let mut uids = vec![];
        while kth < n && self.key(kth) <= hi {
            uids.push(self.son(kth));
            kth += 1;
        }
        let sibling = if kth == n { self.sibling() } else { None };
        (uids, sibling)
    }

    /// Inserts the pair in key order. Returns false when the key belongs to a
    /// node further right.
    pub(crate) fn insert(&mut self, uid: Uid, key: u64) -> bool {
        let n = self.key_count();
        let kth = self.first_key_at_least(key);
        if kth == n && self.sibling().is_some() {
            return false;
        }

        if self.is_leaf() {
            self.shift_from(kth);
            self.set_key(kth, key);
            self.set_son(kth, uid);
        } else {
            // the son at kth was split: it keeps keys below `key`, `uid`
            // takes over the rest of its range
            let upper = self.key(kth);
            self.set_key(kth, key);
            self.shift_from(kth + 1);
            self.set_key(kth + 1, upper);
            self.set_son(kth + 1, uid);
        }
        self.set_key_count(n + 1);
        true
    }

    pub(crate) fn needs_split(&self) -> bool {
        self.key_count() == BALANCE * 2
    }

    /// Moves the upper half into a new node. Returns the new node and the
    /// first key it holds.
    pub(crate) fn split(&mut self, store: &DataStore) -> anyhow::Result<(Uid, u64)> {
        let mut right = Self(vec![0u8; NODE_SIZE]);
        right.set_leaf(self.is_leaf());
        right.set_key_count(BALANCE);
        right.set_sibling(self.sibling());
        let from = Self::pair_offset(BALANCE);
        let to = Self::pair_offset(BALANCE * 2);
        right.0[NODE_HEADER_SIZE..NODE_HEADER_SIZE + (to - from)].copy_from_slice(&self.0[from..to]);

        let right_uid = store.insert(Xid::SUPER, right.as_bytes())?;
        self.set_key_count(BALANCE);
        self.set_sibling(Some(right_uid));
        Ok((right_uid, right.key(0)))
    }
}

pub(crate) enum InsertResult {
    Done,
    // the key belongs to the sibling
    MoveRight(Uid),
    Split { right: Uid, key: u64 },
}

/// A tree node backed by a data item.
pub(crate) struct Node<'a> {
    item: DataItemRef<'a>,
}

impl<'a> Node<'a> {
    pub(crate) fn load(store: &'a DataStore, uid: Uid) -> anyhow::Result<Self> {
        let item = store
            .read(uid)?
            .ok_or_else(|| anyhow!("tree node {uid:?} does not exist"))?;
        Ok(Self { item })
    }

    pub(crate) fn buf(&self) -> anyhow::Result<NodeBuf> {
        NodeBuf::from_raw(self.item.data())
    }

    pub(crate) fn insert_and_split(
        &self,
        store: &DataStore,
        uid: Uid,
        key: u64,
    ) -> anyhow::Result<InsertResult> {
        let mut w = self.item.before();
        let mut buf = NodeBuf::from_raw(w.data())?;

        if !buf.insert(uid, key) {
            let Some(sibling) = buf.sibling() else {
                unreachable!("insert only refuses keys when a sibling exists");
            };
            w.un_before();
            return Ok(InsertResult::MoveRight(sibling));
        }

        let result = if buf.needs_split() {
            match buf.split(store) {
                Ok((right, key)) => InsertResult::Split { right, key },
                Err(err) => {
                    w.un_before();
                    return Err(err);
                }
            }
        } else {
            InsertResult::Done
        };

        w.write(0, buf.as_bytes());
        w.after(Xid::SUPER)?;
        Ok(result)
    }
}
