mod bins;
mod btree;
mod cache;
mod db;
mod error;
mod file_lock;
mod free_space;
mod id;
mod ledger;
mod log;
mod pager;
mod recovery;
mod store;
mod vm;
mod wal;

pub use btree::BPlusTree;
pub use db::{Db, Setting};
pub use error::Error;
pub use id::{Uid, Xid};
pub use vm::IsolationLevel;
