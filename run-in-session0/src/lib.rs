//! Framework that lets a self-contained executable, started with
//! administrative rights in an interactive desktop session, execute a payload
//! function in Session 0 as LocalSystem and capture its output.
//!
//! The same executable plays both roles. Launched by a user, it acts as the
//! originator: it installs itself as a transient demand-start service whose
//! command line carries freshly minted pipe and event names, starts that
//! service, and drains the Session 0 instance's stdout and stderr through two
//! named pipes back into its own output streams. Launched by the service
//! control manager with the handshake argument vector, it acts as the worker:
//! it rewires its standard streams onto the pipes, signals readiness, hosts
//! the payload under a service dispatcher, and signals completion.
//!
//! [`dispatch`] is the only entry point an application needs.

use std::ffi::OsString;

mod dispatch;
mod error;
mod names;
mod originator;
mod reader;
mod win;
mod worker;

pub use dispatch::{dispatch, UsageText};

/// The code to run in Session 0: standard argument vector in, exit code out.
///
/// The payload may write to stdout and stderr; in the worker role both are
/// redirected to the originator before the payload runs. It must tolerate
/// running as LocalSystem in a non-interactive window station.
pub type Payload = fn(&[OsString]) -> i32;

/// Terminal-services session id of the current process, or `None` if it
/// cannot be determined.
pub fn current_session_id() -> Option<u32> {
    use windows::Win32::System::Threading::{GetCurrentProcessId, ProcessIdToSessionId};

    let mut session = 0u32;
    // SAFETY: out parameter is a valid local.
    match unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session) } {
        Ok(()) => Some(session),
        Err(err) => {
            tracing::error!(error = %err, "ProcessIdToSessionId failed");
            None
        }
    }
}
