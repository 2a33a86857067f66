use thiserror::Error;

/// Failures a caller can react to. They travel inside `anyhow::Error` and can be
/// recovered with `err.downcast_ref::<Error>()`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The cache reached its capacity and every entry is still referenced.
    #[error("cache is full")]
    CacheFull,

    /// The record does not fit into a single page.
    #[error("data too large")]
    DataTooLarge,

    /// No page with enough free space could be found or allocated.
    #[error("database is busy")]
    DatabaseBusy,

    /// The transaction was aborted because it conflicted with another one.
    #[error("concurrent update issue")]
    ConcurrentUpdate,

    /// Waiting for the lock would close a cycle in the wait-for graph.
    #[error("deadlock detected")]
    Deadlock,

    #[error("memory too small")]
    MemoryTooSmall,

    /// The log file checksum does not match any prefix of its records.
    #[error("bad log file")]
    BadLogFile,

    /// The ledger file length disagrees with its transaction counter.
    #[error("bad ledger file")]
    BadLedgerFile,

    #[error("transaction is not active")]
    NoTransaction,

    #[error("database is locked by another process")]
    DatabaseLocked,
}

/// Reports an error that cannot be propagated and stops the current thread.
pub(crate) fn fatal(context: &str, err: anyhow::Error) -> ! {
    log::error!("{context}: {err:?}");
    panic!("{context}: {err}");
}
