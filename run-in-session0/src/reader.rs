//! Reader threads that drain the worker's output pipes into the originator's
//! sinks, byte for byte.

use std::os::windows::io::AsRawHandle;
use std::thread::JoinHandle;

use tracing::{debug, warn};
use windows::Win32::Foundation::{ERROR_BROKEN_PIPE, ERROR_OPERATION_ABORTED, HANDLE};
use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows::Win32::System::Threading::TerminateThread;

use crate::win::SendHandle;

/// Read up to 1 MiB at a time so a bursty worker does not stall on flow
/// control.
const READ_CHUNK: usize = 1024 * 1024;

/// One reader thread draining one pipe into one destination sink.
///
/// The reader owns neither handle; the originator keeps both alive until the
/// thread has been joined or terminated. Dropping an unjoined reader forcibly
/// terminates the thread, which is the only way out of a blocked synchronous
/// pipe read during aggressive teardown.
pub(crate) struct PipeReader {
    label: &'static str,
    thread: Option<JoinHandle<()>>,
}

impl PipeReader {
    pub(crate) fn spawn(label: &'static str, source: SendHandle, dest: SendHandle) -> Self {
        let thread = std::thread::spawn(move || drain(label, source, dest));
        Self {
            label,
            thread: Some(thread),
        }
    }

    /// Waitable handle of the underlying OS thread.
    pub(crate) fn thread_handle(&self) -> HANDLE {
        match &self.thread {
            Some(thread) => HANDLE(thread.as_raw_handle()),
            None => HANDLE::default(),
        }
    }

    /// Joins a reader whose thread is already known to have exited.
    pub(crate) fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(label = self.label, "pipe reader thread panicked");
            }
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if !thread.is_finished() {
                debug!(label = self.label, "terminating pipe reader thread");
                // SAFETY: the thread is blocked in a synchronous pipe read
                // with no cancellation point. The leaked read buffer dies
                // with the process, which is about to exit.
                let _ = unsafe { TerminateThread(HANDLE(thread.as_raw_handle()), 0) };
            }
            // Dropping the JoinHandle detaches the thread object.
        }
    }
}

/// Copies pipe bytes to the destination until end of stream.
///
/// A zero-byte read, a broken pipe (the writer exited or closed its end), or
/// an aborted operation (teardown cancelled the handle) all end the loop
/// normally. Write problems are logged and do not end it.
fn drain(label: &'static str, source: SendHandle, dest: SendHandle) {
    debug!(label, "pipe reader starting");
    let mut buffer = vec![0u8; READ_CHUNK];

    loop {
        let mut read = 0u32;
        // SAFETY: `source` is a valid inbound pipe handle that the originator
        // keeps open for longer than this thread runs.
        let result =
            unsafe { ReadFile(source.0, Some(buffer.as_mut_slice()), Some(&mut read), None) };

        match result {
            Ok(()) if read > 0 => {
                let chunk = &buffer[..read as usize];
                let mut written = 0u32;
                // SAFETY: `dest` is a console or file handle kept open by the
                // originator until this thread is done.
                match unsafe { WriteFile(dest.0, Some(chunk), Some(&mut written), None) } {
                    Ok(()) if written != read => {
                        warn!(label, read, written, "short write to destination")
                    }
                    Ok(()) => {}
                    Err(err) => warn!(label, error = %err, "write to destination failed"),
                }
            }
            Ok(()) => break,
            Err(err) if err.code() == ERROR_BROKEN_PIPE.to_hresult() => {
                debug!(label, "pipe closed by the writer");
                break;
            }
            Err(err) if err.code() == ERROR_OPERATION_ABORTED.to_hresult() => {
                debug!(label, "pipe read cancelled");
                break;
            }
            Err(err) => {
                warn!(label, error = %err, "pipe read failed");
                break;
            }
        }
    }

    debug!(label, "pipe reader exiting");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::windows::io::AsRawHandle;

    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Pipes::CreatePipe;

    use super::*;

    #[test]
    fn drains_pipe_bytes_to_destination_in_order() {
        let mut read_end = HANDLE::default();
        let mut write_end = HANDLE::default();
        // SAFETY: out parameters are valid locals; both ends are closed below.
        unsafe { CreatePipe(&mut read_end, &mut write_end, None, 0) }.expect("create pipe");

        let path = std::env::temp_dir().join(format!("pipe-reader-test-{}.bin", std::process::id()));
        let dest = fs::File::create(&path).expect("create destination file");

        let payload: Vec<u8> = (0u8..=255).cycle().take(8 * 1024).collect();
        let mut written = 0u32;
        // SAFETY: the write end is valid and the buffer outlives the call.
        unsafe { WriteFile(write_end, Some(payload.as_slice()), Some(&mut written), None) }
            .expect("write payload");
        assert_eq!(written as usize, payload.len());
        // Closing the write end turns the next read into end-of-stream.
        // SAFETY: we own the handle.
        unsafe { CloseHandle(write_end) }.expect("close write end");

        drain(
            "test",
            SendHandle(read_end),
            SendHandle(HANDLE(dest.as_raw_handle())),
        );
        drop(dest);

        let bytes = fs::read(&path).expect("read destination file");
        let _ = fs::remove_file(&path);
        // SAFETY: we own the handle.
        let _ = unsafe { CloseHandle(read_end) };

        assert_eq!(bytes, payload);
    }
}
