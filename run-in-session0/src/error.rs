//! Originator-side error model. Every failure mode carries its documented
//! process exit code so the dispatcher can surface both the diagnostic and
//! the code without a second mapping table.

use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum OriginatorError {
    #[error("This program requires administrative rights.")]
    AdminRightsRequired,

    #[error("cannot open service control manager: {0}")]
    OpenScm(windows_service::Error),

    #[error("cannot query standard output/error handles: {0}")]
    StdHandles(windows::core::Error),

    #[error("cannot resolve the path of the current executable: {0}")]
    ExePath(std::io::Error),

    #[error("cannot create event object: {0}")]
    CreateEvent(windows::core::Error),

    #[error("cannot build the pipe security descriptor: {0}")]
    SecurityDescriptor(windows::core::Error),

    #[error("cannot create named pipe object: {0}")]
    CreatePipe(windows::core::Error),

    #[error("cannot create service: {0}")]
    CreateService(windows_service::Error),

    #[error("cannot start service: {0}")]
    StartService(windows_service::Error),

    #[error("timed out waiting for the session 0 side to be ready to write")]
    ReadinessTimeout,

    #[error("unexpected result 0x{wait:08x} waiting for 'ready to write'")]
    ReadinessWait { wait: u32 },

    #[error("timed out waiting for the session 0 code to finish and its output to be consumed")]
    CompletionTimeout,

    #[error("unexpected result 0x{wait:08x} waiting for session 0 completion")]
    CompletionWait { wait: u32 },
}

impl OriginatorError {
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            Self::AdminRightsRequired | Self::OpenScm(_) | Self::StdHandles(_) => -1,
            Self::ExePath(_) => -2,
            Self::CreateEvent(_) => -3,
            Self::SecurityDescriptor(_) => -4,
            Self::CreatePipe(_) => -5,
            Self::CreateService(_) => -6,
            Self::StartService(_) => -7,
            Self::ReadinessTimeout => -8,
            Self::ReadinessWait { .. } => -9,
            Self::CompletionTimeout => -10,
            Self::CompletionWait { .. } => -11,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_diagnostic_names_the_missing_right() {
        let message = OriginatorError::AdminRightsRequired.to_string();
        assert!(message.contains("requires administrative rights"));
    }

    #[test]
    fn timeout_codes_are_distinct() {
        assert_eq!(OriginatorError::ReadinessTimeout.exit_code(), -8);
        assert_eq!(OriginatorError::CompletionTimeout.exit_code(), -10);
    }
}
