//! Naming scheme for the kernel objects of one cross-session invocation.

use std::ffi::OsString;

use uuid::Uuid;

/// Switch that marks a command line as the service-side handshake. The value
/// is a fixed random tag so a user cannot plausibly type it by accident.
pub(crate) const SERVICE_SWITCH: &str = "-svcparams_4e4450eda4cd";

/// Exact argument count of the handshake vector: program path, the switch,
/// and the five generated names.
pub(crate) const HANDSHAKE_ARG_COUNT: usize = 7;

const SERVICE_NAME_PREFIX: &str = "RunInSession0_";
const OUTPUT_PIPE_PREFIX: &str = r"\\.\pipe\Out_";
const ERROR_PIPE_PREFIX: &str = r"\\.\pipe\Err_";
const READY_EVENT_PREFIX: &str = r"Global\ReadyToWrite_";
const DONE_EVENT_PREFIX: &str = r"Global\SvcDone_";

/// Names of the transient service and of the four kernel objects one
/// invocation uses, each made unique by a fresh uuid.
///
/// The events live in the Global namespace so the Session 0 process can open
/// them. Uniqueness is additionally enforced where it matters: the pipes are
/// created with first-instance semantics, so a colliding name fails creation.
pub(crate) struct InvocationNames {
    pub service: String,
    pub output_pipe: String,
    pub error_pipe: String,
    pub ready_event: String,
    pub done_event: String,
}

impl InvocationNames {
    pub(crate) fn mint() -> Self {
        Self {
            service: format!("{SERVICE_NAME_PREFIX}{}", Uuid::new_v4()),
            output_pipe: format!("{OUTPUT_PIPE_PREFIX}{}", Uuid::new_v4()),
            error_pipe: format!("{ERROR_PIPE_PREFIX}{}", Uuid::new_v4()),
            ready_event: format!("{READY_EVENT_PREFIX}{}", Uuid::new_v4()),
            done_event: format!("{DONE_EVENT_PREFIX}{}", Uuid::new_v4()),
        }
    }

    /// Arguments baked into the service image path, after the executable
    /// itself. Together with the program path they form the handshake vector
    /// the worker-side detector requires.
    pub(crate) fn launch_arguments(&self) -> Vec<OsString> {
        vec![
            SERVICE_SWITCH.into(),
            self.service.clone().into(),
            self.output_pipe.clone().into(),
            self.error_pipe.clone().into(),
            self.ready_event.clone().into(),
            self.done_event.clone().into(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn uuid_suffix<'a>(name: &'a str, prefix: &str) -> &'a str {
        name.strip_prefix(prefix).expect("name carries its prefix")
    }

    #[test]
    fn minted_names_are_prefixed_and_uuid_shaped() {
        let names = InvocationNames::mint();
        for (name, prefix) in [
            (&names.service, SERVICE_NAME_PREFIX),
            (&names.output_pipe, OUTPUT_PIPE_PREFIX),
            (&names.error_pipe, ERROR_PIPE_PREFIX),
            (&names.ready_event, READY_EVENT_PREFIX),
            (&names.done_event, DONE_EVENT_PREFIX),
        ] {
            let suffix = uuid_suffix(name, prefix);
            Uuid::parse_str(suffix).expect("suffix parses as a uuid");
        }
    }

    #[test]
    fn minted_names_are_pairwise_distinct() {
        let names = InvocationNames::mint();
        let suffixes: HashSet<&str> = [
            uuid_suffix(&names.service, SERVICE_NAME_PREFIX),
            uuid_suffix(&names.output_pipe, OUTPUT_PIPE_PREFIX),
            uuid_suffix(&names.error_pipe, ERROR_PIPE_PREFIX),
            uuid_suffix(&names.ready_event, READY_EVENT_PREFIX),
            uuid_suffix(&names.done_event, DONE_EVENT_PREFIX),
        ]
        .into();
        assert_eq!(suffixes.len(), 5);
    }

    #[test]
    fn launch_arguments_complete_the_handshake_vector() {
        let names = InvocationNames::mint();
        let arguments = names.launch_arguments();
        // The program path supplied by the SCM is the missing seventh token.
        assert_eq!(arguments.len() + 1, HANDSHAKE_ARG_COUNT);
        assert_eq!(arguments[0], OsString::from(SERVICE_SWITCH));
        assert_eq!(arguments[1], OsString::from(names.service.as_str()));
    }
}
