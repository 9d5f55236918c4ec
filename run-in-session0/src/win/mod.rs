//! Thin RAII wrappers over the Win32 kernel objects the crossing protocol
//! uses, plus the wait primitives the originator relies on.

use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Threading::WaitForMultipleObjects;

mod event;
mod handle;
mod pipe;
mod wide_string;

pub(crate) use self::event::Event;
pub(crate) use self::handle::Handle;
pub(crate) use self::pipe::{InboundPipe, SecurityDescriptor};
pub(crate) use self::wide_string::WideString;

/// A raw handle that may cross a thread boundary.
///
/// The wrapper does not own the handle; whoever hands one out must keep the
/// underlying object alive for as long as the receiving thread runs.
#[derive(Clone, Copy)]
pub(crate) struct SendHandle(pub HANDLE);

// SAFETY: a HANDLE is an opaque kernel identifier; using it from another
// thread is safe as long as the object outlives the use, which the
// originator's ownership discipline guarantees.
unsafe impl Send for SendHandle {}

/// Outcome of a bounded single-object wait.
pub(crate) enum WaitOutcome {
    Signaled,
    Timeout,
    /// Raw wait result outside the expected set, reported verbatim.
    Other(u32),
}

/// Outcome of a conjunctive wait on several objects.
pub(crate) enum WaitAll {
    AllSignaled,
    Timeout,
    Other(u32),
}

/// Waits until every handle is signaled or the timeout elapses.
pub(crate) fn wait_all_with_timeout(handles: &[HANDLE], timeout_ms: u32) -> WaitAll {
    // SAFETY: the caller guarantees every handle is valid and waitable for
    // the duration of the call.
    let result = unsafe { WaitForMultipleObjects(handles, true, timeout_ms) };

    let count = handles.len() as u32;
    if (WAIT_OBJECT_0.0..WAIT_OBJECT_0.0 + count).contains(&result.0) {
        WaitAll::AllSignaled
    } else if result == WAIT_TIMEOUT {
        WaitAll::Timeout
    } else {
        WaitAll::Other(result.0)
    }
}
