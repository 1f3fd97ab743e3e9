//! Owning wrapper around a raw OS descriptor.
//!
//! Mirrors `PyroFling::FileHandle`: a move-only handle that closes its descriptor on drop
//! unless explicitly released or it never held a valid descriptor to begin with.

use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use thiserror::Error;

/// Errors produced constructing or duplicating a [`FileHandle`].
#[derive(Error, Debug)]
pub enum HandleError {
    /// The descriptor passed in was negative, i.e. not a valid OS handle.
    #[error("invalid file descriptor")]
    InvalidHandle,
    /// `dup()` (or the underlying `fcntl`) failed.
    #[error("failed to duplicate file descriptor: {0}")]
    DupFailed(#[source] std::io::Error),
}

/// Owns exactly one OS descriptor. At most one [`FileHandle`] is ever the owner of a given
/// live descriptor; duplicating creates a new, independently-owned descriptor via `dup`.
#[derive(Debug)]
pub struct FileHandle(Option<OwnedFd>);

impl FileHandle {
    /// Take ownership of `fd`. Fails if `fd` is negative.
    pub fn new(fd: RawFd) -> Result<Self, HandleError> {
        if fd < 0 {
            return Err(HandleError::InvalidHandle);
        }
        // SAFETY: caller is transferring ownership of a live, valid descriptor to us.
        Ok(FileHandle(Some(unsafe { OwnedFd::from_raw_fd(fd) })))
    }

    /// An empty handle that owns nothing. `native_handle()` returns -1 and the handle is falsy.
    pub fn empty() -> Self {
        FileHandle(None)
    }

    /// True if this handle currently owns a descriptor.
    pub fn is_valid(&self) -> bool {
        self.0.is_some()
    }

    /// The raw descriptor, or -1 if empty. Does not transfer ownership.
    pub fn native_handle(&self) -> RawFd {
        self.0.as_ref().map(AsRawFd::as_raw_fd).unwrap_or(-1)
    }

    /// Transfer ownership of the descriptor to the caller. The handle becomes empty.
    /// Returns -1 if the handle was already empty.
    pub fn release(&mut self) -> RawFd {
        match self.0.take() {
            Some(fd) => fd.into_raw_fd(),
            None => -1,
        }
    }

    /// Duplicate the underlying descriptor (`dup(2)`), returning a new, independently-owned
    /// handle. Fails if this handle is empty or the duplication syscall fails.
    pub fn dup(&self) -> Result<Self, HandleError> {
        let fd = self.0.as_ref().ok_or(HandleError::InvalidHandle)?;
        let dup = fd.try_clone().map_err(HandleError::DupFailed)?;
        Ok(FileHandle(Some(dup)))
    }
}

impl From<OwnedFd> for FileHandle {
    fn from(fd: OwnedFd) -> Self {
        FileHandle(Some(fd))
    }
}

impl AsRawFd for FileHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.native_handle()
    }
}

impl Default for FileHandle {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_fd_is_rejected() {
        assert!(matches!(FileHandle::new(-1), Err(HandleError::InvalidHandle)));
    }

    #[test]
    fn empty_handle_is_falsy() {
        let h = FileHandle::empty();
        assert!(!h.is_valid());
        assert_eq!(h.native_handle(), -1);
    }

    #[test]
    fn release_transfers_ownership() {
        let (r, _w) = nix::unistd::pipe().unwrap();
        let mut h = FileHandle::new(r).unwrap();
        let raw = h.release();
        assert_eq!(raw, r);
        assert!(!h.is_valid());
        // We now own `raw` again; close it to avoid leaking in the test process.
        let _ = nix::unistd::close(raw);
    }

    #[test]
    fn dup_creates_independent_owner() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let _w = FileHandle::new(w).unwrap();
        let h = FileHandle::new(r).unwrap();
        let dup = h.dup().unwrap();
        assert_ne!(h.native_handle(), dup.native_handle());
        assert!(dup.is_valid());
    }
}
