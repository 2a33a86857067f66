use std::fmt;
use std::num::NonZeroU32;

/// Transaction id. Ids are handed out densely starting from 1; 0 is the super
/// transaction which is always committed.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Xid(u64);

impl Xid {
    pub const SUPER: Xid = Xid(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_super(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) fn next(self) -> Self {
        Self(self.0.checked_add(1).unwrap())
    }

    #[inline]
    pub(crate) fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({})", self.0)
    }
}

/// 1-based page number inside the data file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Pgno(NonZeroU32);

impl Pgno {
    pub(crate) const FIRST: Pgno = Pgno(NonZeroU32::MIN);

    #[inline]
    pub(crate) fn new(pgno: u32) -> Option<Self> {
        NonZeroU32::new(pgno).map(Self)
    }

    #[inline]
    pub(crate) fn get(self) -> u32 {
        self.0.get()
    }

    /// Byte offset of the page inside the data file.
    #[inline]
    pub(crate) fn file_offset(self, page_size: usize) -> u64 {
        (self.get() as u64 - 1) * page_size as u64
    }
}

/// Record id: the page number in the upper 32 bits and the in-page offset in
/// the lower 16 bits.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(u64);

impl Uid {
    #[inline]
    pub(crate) fn from_parts(pgno: Pgno, offset: u16) -> Self {
        Self(((pgno.get() as u64) << 32) | offset as u64)
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn page(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn offset(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    #[inline]
    pub(crate) fn pgno(self) -> anyhow::Result<Pgno> {
        Pgno::new(self.page()).ok_or_else(|| anyhow::anyhow!("uid {self:?} points to page 0"))
    }

    #[inline]
    pub(crate) fn from_be_bytes(uid: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(uid))
    }

    #[inline]
    pub(crate) fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({}:{})", self.page(), self.offset())
    }
}
