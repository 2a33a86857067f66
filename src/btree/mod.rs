mod node;

use crate::btree::node::{InsertResult, Node, NodeBuf};
use crate::id::{Uid, Xid};
use crate::store::{DataItemRef, DataStore};
use anyhow::anyhow;
use parking_lot::Mutex;

/// B+Tree from `u64` keys to record uids. Nodes are data items written by the
/// super transaction; the boot item holds the uid of the current root.
///
/// Keys are assumed to be unique. A key equal to a separator is routed to the
/// right child, so copies of it left behind in the left leaf by a split are
/// not found by [`BPlusTree::search`].
pub struct BPlusTree<'a> {
    store: &'a DataStore,
    boot_uid: Uid,
    boot: DataItemRef<'a>,
    boot_lock: Mutex<()>,
}

impl<'a> BPlusTree<'a> {
    /// Writes an empty tree and returns the uid of its boot item.
    pub(crate) fn create(store: &DataStore) -> anyhow::Result<Uid> {
        let root = store.insert(Xid::SUPER, NodeBuf::nil_root().as_bytes())?;
        store.insert(Xid::SUPER, &root.to_be_bytes())
    }

    pub(crate) fn load(boot_uid: Uid, store: &'a DataStore) -> anyhow::Result<Self> {
        let boot = store
            .read(boot_uid)?
            .ok_or_else(|| anyhow!("tree boot item {boot_uid:?} does not exist"))?;
        Ok(Self {
            store,
            boot_uid,
            boot,
            boot_lock: Mutex::new(()),
        })
    }

    pub fn boot_uid(&self) -> Uid {
        self.boot_uid
    }

    fn root_uid(&self) -> anyhow::Result<Uid> {
        let _guard = self.boot_lock.lock();
        self.boot.read(|raw| {
            let raw: [u8; 8] = raw
                .try_into()
                .map_err(|_| anyhow!("tree boot item has {} bytes", raw.len()))?;
            Ok(Uid::from_be_bytes(raw))
        })
    }

    fn update_root(&self, left: Uid, right: Uid, key: u64) -> anyhow::Result<()> {
        let _guard = self.boot_lock.lock();
        let root = self
            .store
            .insert(Xid::SUPER, NodeBuf::root(left, right, key).as_bytes())?;
        let mut w = self.boot.before();
        w.write(0, &root.to_be_bytes());
        w.after(Xid::SUPER)?;
        log::trace!("tree root changed boot={:?} root={root:?}", self.boot_uid);
        Ok(())
    }

    pub fn search(&self, key: u64) -> anyhow::Result<Vec<Uid>> {
        self.search_range(key, key)
    }

    pub fn search_range(&self, lo: u64, hi: u64) -> anyhow::Result<Vec<Uid>> {
        let mut leaf = self.search_leaf(self.root_uid()?, lo)?;
        let mut result = vec![];
        loop {
            let buf = Node::load(self.store, leaf)?.buf()?;
            let (uids, sibling) = buf.leaf_search_range(lo, hi);
            result.extend(uids);
            match sibling {
                Some(sibling) => leaf = sibling,
                None => break,
            }
        }
        Ok(result)
    }

    fn search_leaf(&self, mut uid: Uid, key: u64) -> anyhow::Result<Uid> {
        loop {
            let buf = Node::load(self.store, uid)?.buf()?;
            if buf.is_leaf() {
                return Ok(uid);
            }
            uid = self.search_next(uid, key)?;
        }
    }

    // follows siblings until a node covers `key`
    fn search_next(&self, mut uid: Uid, key: u64) -> anyhow::Result<Uid> {
        loop {
            let buf = Node::load(self.store, uid)?.buf()?;
            if let Some(next) = buf.search_next(key) {
                return Ok(next);
            }
            uid = buf
                .sibling()
                .ok_or_else(|| anyhow!("key {key} is beyond the rightmost node {uid:?}"))?;
        }
    }

    pub fn insert(&self, key: u64, uid: Uid) -> anyhow::Result<()> {
        let root = self.root_uid()?;
        if let Some((right, split_key)) = self.insert_at(root, uid, key)? {
            self.update_root(root, right, split_key)?;
        }
        Ok(())
    }

    fn insert_at(&self, node: Uid, uid: Uid, key: u64) -> anyhow::Result<Option<(Uid, u64)>> {
        let is_leaf = Node::load(self.store, node)?.buf()?.is_leaf();
        if is_leaf {
            return self.insert_and_split(node, uid, key);
        }

        let next = self.search_next(node, key)?;
        match self.insert_at(next, uid, key)? {
            Some((right, split_key)) => self.insert_and_split(node, right, split_key),
            None => Ok(None),
        }
    }

    fn insert_and_split(
        &self,
        mut node: Uid,
        uid: Uid,
        key: u64,
    ) -> anyhow::Result<Option<(Uid, u64)>> {
        loop {
            match Node::load(self.store, node)?.insert_and_split(self.store, uid, key)? {
                InsertResult::Done => return Ok(None),
                InsertResult::MoveRight(sibling) => node = sibling,
                InsertResult::Split { right, key } => return Ok(Some((right, key))),
            }
        }
    }
}
