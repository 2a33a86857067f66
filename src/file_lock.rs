use crate::error::Error;
use anyhow::anyhow;
use std::fs::File;
use syscalls::{syscall2, Errno, Sysno};

pub(crate) trait FileLock: Sized {
    /// Takes an exclusive advisory lock without waiting. The lock lives as long
    /// as the file handle.
    fn try_lock(self) -> anyhow::Result<Self>;
}

#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
impl FileLock for File {
    fn try_lock(self) -> anyhow::Result<Self> {
        const LOCK_EX: usize = 0x2;
        const LOCK_NB: usize = 0x4;

        let fd = self.as_raw_fd();
        match unsafe { syscall2(Sysno::flock, fd as usize, LOCK_EX | LOCK_NB) } {
            Ok(_) => Ok(self),
            Err(err) if err == Errno::EAGAIN => Err(Error::DatabaseLocked.into()),
            Err(err) => Err(anyhow!("cannot lock file {fd} errno={err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn test_second_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .unwrap()
        };

        let first = open().try_lock().unwrap();
        let err = open().try_lock().unwrap_err();
        assert_eq!(Some(&Error::DatabaseLocked), err.downcast_ref::<Error>());

        drop(first);
        open().try_lock().unwrap();
    }
}
