//! Interactive-session side of the crossing: stands up the transient service,
//! transports the worker's streams, enforces the deadline, and guarantees
//! teardown on every path.

use std::cell::Cell;
use std::ffi::OsString;
use std::fs::File;
use std::os::windows::io::AsRawHandle;
use std::path::Path;

use tracing::{debug, warn};
use windows::Win32::Foundation::{ERROR_ACCESS_DENIED, HANDLE};
use windows::Win32::System::Console::{GetStdHandle, STD_ERROR_HANDLE, STD_OUTPUT_HANDLE};
use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, INFINITE, PROCESS_TERMINATE};
use windows_service::service::{
    ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceType,
};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

use crate::error::OriginatorError;
use crate::names::InvocationNames;
use crate::reader::PipeReader;
use crate::win::{
    self, Event, Handle, InboundPipe, SecurityDescriptor, SendHandle, WaitAll, WaitOutcome,
};

pub(crate) const DEFAULT_DEADLINE_SECS: u32 = 30;

/// Bound on the worker's stream-redirection handshake.
const READY_TIMEOUT_MS: u32 = 10_000;

/// Exit code forced onto a worker process whose control handler stopped
/// responding. The value is a stable sentinel with no further meaning.
const RUNAWAY_EXIT_CODE: u32 = -32i32 as u32;

/// Full control for built-in Administrators and LocalSystem, nothing for
/// anyone else, DACL protected against inheritance.
const PIPE_SDDL: &str = "D:P(A;;FA;;;BA)(A;;FA;;;SY)";

/// Where the worker's two streams end up.
pub(crate) struct Sinks {
    pub output: SendHandle,
    pub error: SendHandle,
}

impl Sinks {
    /// Resolves the sinks for this invocation: the redirection file if the
    /// user asked for one, the process's own streams otherwise. The caller
    /// keeps `redirect` open until the crossing has finished.
    pub(crate) fn resolve(redirect: Option<&File>) -> Result<Self, OriginatorError> {
        let output = match redirect {
            Some(file) => HANDLE(file.as_raw_handle()),
            // SAFETY: no preconditions.
            None => unsafe { GetStdHandle(STD_OUTPUT_HANDLE) }
                .map_err(OriginatorError::StdHandles)?,
        };
        // SAFETY: no preconditions.
        let error =
            unsafe { GetStdHandle(STD_ERROR_HANDLE) }.map_err(OriginatorError::StdHandles)?;
        Ok(Self {
            output: SendHandle(output),
            error: SendHandle(error),
        })
    }
}

/// Converts the user-facing seconds value into a wait argument, guarding the
/// multiplication: anything at or past ~49 days becomes an infinite wait.
pub(crate) fn deadline_millis(secs: u32) -> u32 {
    if secs >= 4_294_967 {
        INFINITE
    } else {
        secs * 1000
    }
}

/// Runs one complete crossing. All kernel objects created here are released
/// when the function returns, on the failure paths included; the post-start
/// failure paths additionally escalate to terminating the worker process
/// before the service is deleted.
pub(crate) fn run(
    payload_args: &[OsString],
    deadline_secs: u32,
    sinks: &Sinks,
) -> Result<(), OriginatorError> {
    let deadline = deadline_millis(deadline_secs);
    debug!(deadline_ms = deadline, "starting cross-session invocation");

    // Opening the SCM doubles as the privilege check, so it comes first.
    let manager = ServiceManager::local_computer(
        None::<&str>,
        ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
    )
    .map_err(|err| {
        if is_access_denied(&err) {
            OriginatorError::AdminRightsRequired
        } else {
            OriginatorError::OpenScm(err)
        }
    })?;

    let exe = std::env::current_exe().map_err(OriginatorError::ExePath)?;

    let names = InvocationNames::mint();
    debug!(
        service = %names.service,
        output_pipe = %names.output_pipe,
        error_pipe = %names.error_pipe,
        "minted invocation names"
    );

    let ready = Event::create_manual_reset(&names.ready_event)
        .map_err(OriginatorError::CreateEvent)?;
    let done =
        Event::create_manual_reset(&names.done_event).map_err(OriginatorError::CreateEvent)?;

    let descriptor =
        SecurityDescriptor::from_sddl(PIPE_SDDL).map_err(OriginatorError::SecurityDescriptor)?;
    let output_pipe = InboundPipe::create(&names.output_pipe, &descriptor)
        .map_err(OriginatorError::CreatePipe)?;
    let error_pipe =
        InboundPipe::create(&names.error_pipe, &descriptor).map_err(OriginatorError::CreatePipe)?;

    let service = TransientService::install(&manager, &names, &exe)?;
    service.start(payload_args)?;

    let result = supervise(&ready, &done, &output_pipe, &error_pipe, sinks, deadline);
    if result.is_err() {
        // The worker may be wedged inside an unresponsive control callback;
        // a graceful stop could hang, so the guard kills the process instead.
        service.escalate();
    }
    result

    // Drop order from here: the service guard (terminating the worker process
    // first if escalated, then deleting the service), the pipes, the security
    // descriptor allocation, both events, and finally the SCM handle.
}

/// The streaming phase: waits for the worker's readiness signal, then drains
/// both pipes while waiting, conjunctively and under the deadline, for the
/// completion event and both reader threads.
fn supervise(
    ready: &Event,
    done: &Event,
    output_pipe: &InboundPipe,
    error_pipe: &InboundPipe,
    sinks: &Sinks,
    deadline_ms: u32,
) -> Result<(), OriginatorError> {
    match ready.wait(READY_TIMEOUT_MS) {
        WaitOutcome::Signaled => debug!("session 0 side is ready to write"),
        WaitOutcome::Timeout => return Err(OriginatorError::ReadinessTimeout),
        WaitOutcome::Other(wait) => return Err(OriginatorError::ReadinessWait { wait }),
    }

    // Readers are not spawned before readiness: a read on an unconnected pipe
    // would race the worker's client-side open.
    let output_reader = PipeReader::spawn("stdout", SendHandle(output_pipe.raw()), sinks.output);
    let error_reader = PipeReader::spawn("stderr", SendHandle(error_pipe.raw()), sinks.error);

    let handles = [
        done.raw(),
        output_reader.thread_handle(),
        error_reader.thread_handle(),
    ];
    match win::wait_all_with_timeout(&handles, deadline_ms) {
        WaitAll::AllSignaled => {
            debug!("session 0 code done, and its output consumed");
            output_reader.join();
            error_reader.join();
            Ok(())
        }
        // The reader guards terminate their still-blocked threads on drop.
        WaitAll::Timeout => Err(OriginatorError::CompletionTimeout),
        WaitAll::Other(wait) => Err(OriginatorError::CompletionWait { wait }),
    }
}

fn is_access_denied(err: &windows_service::Error) -> bool {
    matches!(
        err,
        windows_service::Error::Winapi(io)
            if io.raw_os_error() == Some(ERROR_ACCESS_DENIED.0 as i32)
    )
}

/// A demand-start LocalSystem service that exists only for the lifetime of
/// one invocation. Dropping the guard deletes the service; an escalated guard
/// first terminates the service's process, because its control handler can no
/// longer be trusted to answer a stop request.
struct TransientService {
    service: Option<windows_service::service::Service>,
    name: String,
    escalated: Cell<bool>,
}

impl TransientService {
    fn install(
        manager: &ServiceManager,
        names: &InvocationNames,
        exe: &Path,
    ) -> Result<Self, OriginatorError> {
        let info = ServiceInfo {
            name: OsString::from(&names.service),
            display_name: OsString::from(&names.service),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::OnDemand,
            error_control: ServiceErrorControl::Normal,
            executable_path: exe.to_path_buf(),
            launch_arguments: names.launch_arguments(),
            dependencies: vec![],
            // LocalSystem, no password.
            account_name: None,
            account_password: None,
        };

        let service = manager
            .create_service(
                &info,
                ServiceAccess::START | ServiceAccess::QUERY_STATUS | ServiceAccess::DELETE,
            )
            .map_err(OriginatorError::CreateService)?;
        debug!(service = %names.service, "transient service created");

        Ok(Self {
            service: Some(service),
            name: names.service.clone(),
            escalated: Cell::new(false),
        })
    }

    /// Starts the service, handing the payload arguments through so they
    /// arrive in the worker's service main after the service name.
    fn start(&self, payload_args: &[OsString]) -> Result<(), OriginatorError> {
        if let Some(service) = &self.service {
            service.start(payload_args).map_err(|err| {
                self.escalate();
                OriginatorError::StartService(err)
            })?;
            debug!(service = %self.name, "service started after installation");
        }
        Ok(())
    }

    fn escalate(&self) {
        self.escalated.set(true);
    }

    /// Looks up the service's process and terminates it outright.
    fn terminate_worker_process(&self) {
        let Some(service) = &self.service else { return };
        let pid = match service.query_status() {
            Ok(status) => status.process_id,
            Err(err) => {
                warn!(service = %self.name, error = %err, "could not query service status");
                return;
            }
        };
        let Some(pid) = pid.filter(|pid| *pid != 0) else {
            debug!(service = %self.name, "no worker process to terminate");
            return;
        };

        debug!(service = %self.name, pid, "terminating worker process");
        // SAFETY: the process handle is owned by the wrapper and closed on drop.
        let process = match unsafe { OpenProcess(PROCESS_TERMINATE, false, pid) } {
            Ok(raw) => unsafe { Handle::new_owned(raw) },
            Err(err) => {
                warn!(pid, error = %err, "could not open worker process to terminate it");
                return;
            }
        };
        // SAFETY: the handle was opened with PROCESS_TERMINATE access.
        match unsafe { TerminateProcess(process.raw(), RUNAWAY_EXIT_CODE) } {
            Ok(()) => debug!(pid, "worker process terminated"),
            Err(err) => warn!(pid, error = %err, "could not terminate worker process"),
        }
    }
}

impl Drop for TransientService {
    fn drop(&mut self) {
        if self.escalated.get() {
            self.terminate_worker_process();
        }
        if let Some(service) = self.service.take() {
            match service.delete() {
                Ok(()) => debug!(service = %self.name, "service deleted"),
                Err(err) => warn!(service = %self.name, error = %err, "cannot delete service"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_converts_seconds_with_overflow_guard() {
        assert_eq!(deadline_millis(1), 1000);
        assert_eq!(deadline_millis(DEFAULT_DEADLINE_SECS), 30_000);
        assert_eq!(deadline_millis(4_294_966), 4_294_966_000);
        assert_eq!(deadline_millis(4_294_967), INFINITE);
        assert_eq!(deadline_millis(u32::MAX), INFINITE);
    }

    #[test]
    fn runaway_sentinel_is_stable() {
        assert_eq!(RUNAWAY_EXIT_CODE as i32, -32);
    }
}
