use windows::Win32::Foundation::{CloseHandle, HANDLE};

/// An owned Windows [`HANDLE`], closed on drop.
#[derive(Debug)]
pub(crate) struct Handle {
    raw: HANDLE,
}

// SAFETY: a HANDLE is, by definition, thread safe.
unsafe impl Send for Handle {}

// SAFETY: a HANDLE is simply an integer, no dereferencing is done.
unsafe impl Sync for Handle {}

impl Handle {
    /// Wraps an owned Windows [`HANDLE`].
    ///
    /// # Safety
    ///
    /// - `raw` is a valid handle to an open object.
    /// - `raw` is not a pseudohandle.
    /// - The caller is actually responsible for closing the handle, i.e. no
    ///   other owner will close it.
    pub(crate) unsafe fn new_owned(raw: HANDLE) -> Self {
        debug_assert!(!raw.is_invalid() && !raw.0.is_null());
        Self { raw }
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.raw
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // SAFETY: `self.raw` is a valid handle to an open object by construction.
        let _ = unsafe { CloseHandle(self.raw) };
    }
}
