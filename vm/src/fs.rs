//! The slice of the file system the pager depends on.

/// Identity of the on-disk object behind an open file. Two handles opened on
/// the same file report the same `InodeId`.
pub type InodeId = u32;

/// An open file handle.
///
/// Reads and writes never move a cursor; closing a handle is dropping its
/// last `Arc`.
pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes read. Reading at or past the end returns 0.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;

    /// Writes `buf` at `offset`, returning the number of bytes written.
    fn write_at(&self, buf: &[u8], offset: usize) -> usize;

    fn length(&self) -> usize;

    fn inode(&self) -> InodeId;
}
