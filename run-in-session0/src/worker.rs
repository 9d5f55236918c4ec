//! Session 0 side of the crossing: rewires the standard streams onto the
//! originator's pipes, hosts the payload under a service dispatcher, and
//! reports lifecycle to the service control manager.

use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, error, warn};
use windows::Win32::Foundation::{ERROR_FAILED_SERVICE_CONTROLLER_CONNECT, GENERIC_WRITE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_NONE, OPEN_EXISTING,
};
use windows::Win32::System::Console::{SetStdHandle, STD_ERROR_HANDLE, STD_HANDLE, STD_OUTPUT_HANDLE};
use windows_service::define_windows_service;
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus, ServiceType,
};
use windows_service::service_control_handler::{
    self, ServiceControlHandlerResult, ServiceStatusHandle,
};
use windows_service::service_dispatcher;

use crate::win::{Event, Handle, WideString};
use crate::Payload;

/// The five names carried by the service-side argument vector.
pub(crate) struct Handshake {
    pub service_name: OsString,
    pub output_pipe: OsString,
    pub error_pipe: OsString,
    pub ready_event: OsString,
    pub done_event: OsString,
}

/// State the service main needs but cannot receive through its fixed
/// signature. Written exactly once per process, before the dispatcher starts.
struct WorkerContext {
    payload: Payload,
    /// Pipe client handles backing the redirected standard streams. They stay
    /// open for the rest of the process's life.
    _redirections: Vec<Handle>,
}

static CONTEXT: OnceLock<WorkerContext> = OnceLock::new();

/// Runs the worker role to completion and returns the process exit code.
///
/// Redirection failures are logged and tolerated: the payload then writes
/// into a detached stream and produces no visible output, which is preferable
/// to not running it at all. Completion is signalled no matter how the
/// dispatcher fared, so the originator never waits out its full deadline on a
/// worker that got this far.
pub(crate) fn run(payload: Payload, handshake: Handshake) -> i32 {
    debug!(service = %handshake.service_name.to_string_lossy(), "worker role starting");

    let mut redirections = Vec::with_capacity(2);
    match redirect_stream(STD_OUTPUT_HANDLE, &handshake.output_pipe) {
        Ok(handle) => redirections.push(handle),
        Err(err) => warn!(error = %err, "cannot redirect stdout onto the output pipe"),
    }
    match redirect_stream(STD_ERROR_HANDLE, &handshake.error_pipe) {
        Ok(handle) => redirections.push(handle),
        Err(err) => warn!(error = %err, "cannot redirect stderr onto the error pipe"),
    }

    let context = WorkerContext {
        payload,
        _redirections: redirections,
    };
    if CONTEXT.set(context).is_err() {
        error!("worker context already initialised; one crossing per process");
        return -1;
    }

    // The originator must not start reading before both streams are wired.
    signal_named_event(&handshake.ready_event, "ready to write");

    let exit_code = match service_dispatcher::start(&handshake.service_name, ffi_service_main) {
        Ok(()) => 0,
        Err(err) => dispatcher_exit_code(&err),
    };

    signal_named_event(&handshake.done_event, "service done");
    exit_code
}

/// Reopens one standard stream onto the client end of a named pipe.
fn redirect_stream(slot: STD_HANDLE, pipe_name: &OsStr) -> windows::core::Result<Handle> {
    let wide = WideString::from_os(pipe_name);
    // SAFETY: `wide` outlives the call.
    let raw = unsafe {
        CreateFileW(
            wide.as_pcwstr(),
            GENERIC_WRITE.0,
            FILE_SHARE_NONE,
            None,
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            None,
        )?
    };
    // SAFETY: the handle is valid and stays alive in the worker context.
    let handle = unsafe { Handle::new_owned(raw) };
    // SAFETY: the slot receives a handle that outlives all further stream use.
    unsafe { SetStdHandle(slot, handle.raw())? };
    Ok(handle)
}

fn signal_named_event(name: &OsStr, label: &'static str) {
    match Event::open_for_signal(name) {
        Ok(event) => match event.set() {
            Ok(()) => debug!(label, "event signaled"),
            Err(err) => warn!(label, error = %err, "cannot signal event"),
        },
        Err(err) => warn!(label, error = %err, "cannot open event to signal it"),
    }
}

fn dispatcher_exit_code(err: &windows_service::Error) -> i32 {
    if let windows_service::Error::Winapi(io) = err {
        if let Some(code) = io.raw_os_error() {
            if code == ERROR_FAILED_SERVICE_CONTROLLER_CONNECT.0 as i32 {
                error!(
                    "could not connect to the service controller; the cross-session argument \
                     vector is only valid when this executable is started by the service \
                     control manager"
                );
            } else {
                error!(code, error = %io, "service control dispatcher failed");
            }
            return code;
        }
    }
    error!(error = %err, "service control dispatcher failed");
    -1
}

define_windows_service!(ffi_service_main, service_main);

fn service_main(arguments: Vec<OsString>) {
    // Argument 0 is the service name; the rest are the payload's.
    let service_name = arguments.first().cloned().unwrap_or_default();

    let ledger = Arc::new(Mutex::new(StatusLedger::new()));
    let status_slot: Arc<OnceLock<ServiceStatusHandle>> = Arc::new(OnceLock::new());

    let handler_ledger = Arc::clone(&ledger);
    let handler_slot = Arc::clone(&status_slot);
    let handler = move |control| match control {
        ServiceControl::Stop | ServiceControl::Shutdown => {
            // The payload cannot be interrupted; acknowledge and let it return.
            report(
                &handler_slot,
                &handler_ledger,
                StatusRequest::state(ServiceState::StopPending),
            );
            ServiceControlHandlerResult::NoError
        }
        ServiceControl::Interrogate => {
            report(&handler_slot, &handler_ledger, StatusRequest::repeat());
            ServiceControlHandlerResult::NoError
        }
        _ => ServiceControlHandlerResult::NotImplemented,
    };

    let status_handle = match service_control_handler::register(&service_name, handler) {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "cannot register the service control handler");
            return;
        }
    };
    let _ = status_slot.set(status_handle);

    report(
        &status_slot,
        &ledger,
        StatusRequest::state(ServiceState::StartPending),
    );
    report(
        &status_slot,
        &ledger,
        StatusRequest::state(ServiceState::Running),
    );

    let exit_code = match CONTEXT.get() {
        Some(context) => {
            let code = (context.payload)(arguments.get(1..).unwrap_or(&[]));
            debug!(code, "payload returned");
            code
        }
        None => {
            error!("no payload registered to run");
            0
        }
    };

    // Push any buffered payload output through the pipes before the stopped
    // report lets the originator finish.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    report(
        &status_slot,
        &ledger,
        StatusRequest::stopped(exit_code as u32),
    );
}

fn report(
    slot: &OnceLock<ServiceStatusHandle>,
    ledger: &Mutex<StatusLedger>,
    request: StatusRequest,
) {
    let Some(handle) = slot.get() else { return };
    let status = match ledger.lock() {
        Ok(mut ledger) => ledger.apply(request),
        Err(_) => return,
    };
    if let Err(err) = handle.set_service_status(status) {
        warn!(error = %err, "cannot report service status");
    }
}

/// A status update for the SCM: optionally a new state, optionally an exit
/// code. An empty request re-reports the current state.
struct StatusRequest {
    new_state: Option<ServiceState>,
    exit_code: Option<u32>,
}

impl StatusRequest {
    fn state(state: ServiceState) -> Self {
        Self {
            new_state: Some(state),
            exit_code: None,
        }
    }

    fn stopped(exit_code: u32) -> Self {
        Self {
            new_state: Some(ServiceState::Stopped),
            exit_code: Some(exit_code),
        }
    }

    fn repeat() -> Self {
        Self {
            new_state: None,
            exit_code: None,
        }
    }
}

/// Bookkeeping behind the statuses reported to the SCM. Terminal states clear
/// the checkpoint and wait hint; pending states report a 3 s hint and a
/// checkpoint that starts at 1 for each new pending phase and increments on
/// every further report inside that phase.
struct StatusLedger {
    current: ServiceState,
    checkpoint: u32,
    in_pending: bool,
}

const PENDING_WAIT_HINT: Duration = Duration::from_millis(3000);

impl StatusLedger {
    fn new() -> Self {
        Self {
            current: ServiceState::StartPending,
            checkpoint: 0,
            in_pending: false,
        }
    }

    fn apply(&mut self, request: StatusRequest) -> ServiceStatus {
        let target = request.new_state.unwrap_or(self.current);
        let mut wait_hint = PENDING_WAIT_HINT;

        match target {
            ServiceState::Stopped | ServiceState::Running | ServiceState::Paused => {
                self.checkpoint = 0;
                self.in_pending = false;
                wait_hint = Duration::ZERO;
            }
            _ => {
                let new_phase = !self.in_pending
                    || (request.new_state.is_some() && target != self.current);
                if new_phase {
                    self.checkpoint = 1;
                    self.in_pending = true;
                } else {
                    self.checkpoint += 1;
                }
            }
        }

        if request.new_state.is_some() {
            self.current = target;
        }

        ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: self.current,
            controls_accepted: ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN,
            exit_code: ServiceExitCode::Win32(request.exit_code.unwrap_or(0)),
            checkpoint: self.checkpoint,
            wait_hint,
            process_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_phase_checkpoints_start_at_one_and_increment() {
        let mut ledger = StatusLedger::new();

        let status = ledger.apply(StatusRequest::state(ServiceState::StartPending));
        assert_eq!(status.current_state, ServiceState::StartPending);
        assert_eq!(status.checkpoint, 1);
        assert_eq!(status.wait_hint, PENDING_WAIT_HINT);

        let status = ledger.apply(StatusRequest::state(ServiceState::StartPending));
        assert_eq!(status.checkpoint, 2);
    }

    #[test]
    fn terminal_states_clear_checkpoint_and_wait_hint() {
        let mut ledger = StatusLedger::new();
        ledger.apply(StatusRequest::state(ServiceState::StartPending));

        let status = ledger.apply(StatusRequest::state(ServiceState::Running));
        assert_eq!(status.current_state, ServiceState::Running);
        assert_eq!(status.checkpoint, 0);
        assert_eq!(status.wait_hint, Duration::ZERO);
    }

    #[test]
    fn checkpoint_resets_at_each_phase_boundary() {
        let mut ledger = StatusLedger::new();
        ledger.apply(StatusRequest::state(ServiceState::StartPending));
        ledger.apply(StatusRequest::state(ServiceState::StartPending));
        ledger.apply(StatusRequest::state(ServiceState::Running));

        let status = ledger.apply(StatusRequest::state(ServiceState::StopPending));
        assert_eq!(status.checkpoint, 1);
    }

    #[test]
    fn repeat_reports_current_state_and_advances_pending_checkpoint() {
        let mut ledger = StatusLedger::new();
        ledger.apply(StatusRequest::state(ServiceState::Running));

        let status = ledger.apply(StatusRequest::repeat());
        assert_eq!(status.current_state, ServiceState::Running);
        assert_eq!(status.checkpoint, 0);

        ledger.apply(StatusRequest::state(ServiceState::StopPending));
        let status = ledger.apply(StatusRequest::repeat());
        assert_eq!(status.current_state, ServiceState::StopPending);
        assert_eq!(status.checkpoint, 2);
    }

    #[test]
    fn stopped_report_carries_the_payload_exit_code() {
        let mut ledger = StatusLedger::new();
        ledger.apply(StatusRequest::state(ServiceState::StartPending));
        ledger.apply(StatusRequest::state(ServiceState::Running));

        let status = ledger.apply(StatusRequest::stopped(7));
        assert_eq!(status.current_state, ServiceState::Stopped);
        assert_eq!(status.exit_code, ServiceExitCode::Win32(7));
        assert_eq!(status.checkpoint, 0);
    }
}
