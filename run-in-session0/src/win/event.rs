use std::ffi::OsStr;

use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Threading::{
    CreateEventW, OpenEventW, SetEvent, WaitForSingleObject, EVENT_MODIFY_STATE,
};

use crate::win::{Handle, WaitOutcome, WideString};

/// RAII wrapper for a named manual-reset event.
#[derive(Debug)]
pub(crate) struct Event {
    handle: Handle,
}

impl Event {
    /// Creates the event: manual reset, initially non-signaled. Names in the
    /// `Global\` namespace are reachable from Session 0.
    pub(crate) fn create_manual_reset(name: &str) -> windows::core::Result<Self> {
        let wide = WideString::new(name);
        // SAFETY: `wide` outlives the call.
        let raw = unsafe { CreateEventW(None, true, false, wide.as_pcwstr())? };
        // SAFETY: the handle is valid and we are its only owner.
        Ok(Self {
            handle: unsafe { Handle::new_owned(raw) },
        })
    }

    /// Opens an existing event with just enough access to signal it.
    pub(crate) fn open_for_signal(name: &OsStr) -> windows::core::Result<Self> {
        let wide = WideString::from_os(name);
        // SAFETY: `wide` outlives the call.
        let raw = unsafe { OpenEventW(EVENT_MODIFY_STATE, false, wide.as_pcwstr())? };
        // SAFETY: the handle is valid and we are its only owner.
        Ok(Self {
            handle: unsafe { Handle::new_owned(raw) },
        })
    }

    pub(crate) fn set(&self) -> windows::core::Result<()> {
        // SAFETY: the handle is valid and we are its owner.
        unsafe { SetEvent(self.handle.raw()) }
    }

    pub(crate) fn wait(&self, timeout_ms: u32) -> WaitOutcome {
        // SAFETY: the handle is valid and waitable for the duration of the call.
        match unsafe { WaitForSingleObject(self.handle.raw(), timeout_ms) } {
            WAIT_OBJECT_0 => WaitOutcome::Signaled,
            WAIT_TIMEOUT => WaitOutcome::Timeout,
            other => WaitOutcome::Other(other.0),
        }
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.handle.raw()
    }
}
