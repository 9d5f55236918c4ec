//! Start-up triage: decides, with no side effects, whether this process is
//! the worker spawned by the service control manager or the originator
//! driving an invocation, then runs the chosen role.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::names::{HANDSHAKE_ARG_COUNT, SERVICE_SWITCH};
use crate::originator::{self, Sinks, DEFAULT_DEADLINE_SECS};
use crate::worker::{self, Handshake};
use crate::{current_session_id, Payload};

/// Application-specific text for the usage screen.
pub struct UsageText {
    /// What the program does, indented ready for printing.
    pub description: &'static str,
    /// The payload's own options, indented ready for printing.
    pub payload_params: &'static str,
}

/// What one parsed argument vector asks for.
enum Invocation {
    /// The service-side handshake: run the payload in this process under the
    /// service dispatcher.
    Worker(Handshake),
    /// `-here`: run the payload in this session, skipping the crossing.
    RunHere { payload_args: Vec<OsString> },
    /// The full crossing into Session 0.
    Cross {
        deadline_secs: u32,
        output_file: Option<PathBuf>,
        payload_args: Vec<OsString>,
    },
    /// Print usage, optionally preceded by an error line, and exit -1.
    Usage { error: Option<String> },
}

/// Entry point for applications embedding the framework: parses the process
/// argument vector, plays the appropriate role, and returns the process exit
/// code.
pub fn dispatch(payload: Payload, usage: &UsageText) -> i32 {
    let args: Vec<OsString> = std::env::args_os().collect();
    debug!(pid = std::process::id(), argc = args.len(), "dispatching");

    let Some(session_id) = current_session_id() else {
        eprintln!("Unable to determine which session the current process is in");
        return -1;
    };

    match triage(&args, session_id == 0) {
        Invocation::Worker(handshake) => worker::run(payload, handshake),
        Invocation::RunHere { payload_args } => payload(&payload_args),
        Invocation::Cross {
            deadline_secs,
            output_file,
            payload_args,
        } => {
            // Keep the redirection file open until both reader threads are
            // done with its handle.
            let redirect = match output_file {
                Some(path) => match File::create(&path) {
                    Ok(file) => Some(file),
                    Err(err) => {
                        eprintln!("Cannot open {}: {err}", path.display());
                        return print_usage(args.first(), usage, None);
                    }
                },
                None => None,
            };

            let sinks = match Sinks::resolve(redirect.as_ref()) {
                Ok(sinks) => sinks,
                Err(err) => {
                    eprintln!("{err}");
                    return err.exit_code();
                }
            };

            match originator::run(&payload_args, deadline_secs, &sinks) {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("{err}");
                    err.exit_code()
                }
            }
        }
        Invocation::Usage { error } => print_usage(args.first(), usage, error.as_deref()),
    }
}

/// Pure decision function over the argument vector.
///
/// The handshake shape (exact argument count plus the magic switch in first
/// position) is only honoured in Session 0; anywhere else those tokens fall
/// through to the payload like any other unrecognised argument.
fn triage(args: &[OsString], in_session0: bool) -> Invocation {
    if in_session0
        && args.len() == HANDSHAKE_ARG_COUNT
        && args[1].to_str() == Some(SERVICE_SWITCH)
    {
        return Invocation::Worker(Handshake {
            service_name: args[2].clone(),
            output_pipe: args[3].clone(),
            error_pipe: args[4].clone(),
            ready_event: args[5].clone(),
            done_event: args[6].clone(),
        });
    }

    let mut stay_here = false;
    let mut deadline_override = None;
    let mut output_file = None;
    let mut payload_args = Vec::new();

    let mut ix = 1;
    while ix < args.len() {
        match args[ix].to_str() {
            Some("/?") | Some("-?") | Some("-help") | Some("/help") => {
                return Invocation::Usage { error: None };
            }
            Some("-here") => stay_here = true,
            Some("-t") => {
                ix += 1;
                let Some(value) = args.get(ix) else {
                    return Invocation::Usage {
                        error: Some("Missing arg for -t".into()),
                    };
                };
                match value.to_str().and_then(|text| text.parse::<u32>().ok()) {
                    Some(secs) if secs > 0 => deadline_override = Some(secs),
                    _ => {
                        return Invocation::Usage {
                            error: Some("Invalid arg for -t".into()),
                        };
                    }
                }
            }
            Some("-o") => {
                ix += 1;
                let Some(path) = args.get(ix) else {
                    return Invocation::Usage {
                        error: Some("Missing arg for -o".into()),
                    };
                };
                output_file = Some(PathBuf::from(path));
            }
            _ => {
                // First unrecognised token: everything from here on belongs
                // to the payload, verbatim.
                payload_args = args[ix..].to_vec();
                break;
            }
        }
        ix += 1;
    }

    if stay_here && (deadline_override.is_some() || output_file.is_some()) {
        return Invocation::Usage {
            error: Some("Invalid combination of options".into()),
        };
    }

    if stay_here {
        Invocation::RunHere { payload_args }
    } else {
        Invocation::Cross {
            deadline_secs: deadline_override.unwrap_or(DEFAULT_DEADLINE_SECS),
            output_file,
            payload_args,
        }
    }
}

/// Prints usage to stderr the way the rest of the diagnostics go, and returns
/// the usage exit code.
fn print_usage(argv0: Option<&OsString>, usage: &UsageText, error: Option<&str>) -> i32 {
    let exe = argv0
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    if let Some(error) = error {
        eprintln!("{error}");
    }
    eprintln!();
    eprintln!("{exe}:");
    eprintln!("{}", usage.description);
    eprintln!();
    eprintln!("Usage:");
    eprintln!();
    eprintln!("    {exe} [-here] [additional params]");
    eprintln!("    {exe} [-t timeout] [-o outfile] [additional params]");
    eprintln!();
    eprintln!("  -here : run the code in the current session rather than in session 0");
    eprintln!("  -t    : max time in seconds for the session-0 service code to complete (default {DEFAULT_DEADLINE_SECS} seconds)");
    eprintln!("  -o    : redirect stdout from the session-0 code to named file");
    eprintln!();
    eprintln!("additional params (these must come last):");
    eprintln!("{}", usage.payload_params);
    eprintln!();
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(tokens: &[&str]) -> Vec<OsString> {
        tokens.iter().map(OsString::from).collect()
    }

    fn handshake_args() -> Vec<OsString> {
        args(&[
            r"C:\tools\app.exe",
            SERVICE_SWITCH,
            "RunInSession0_x",
            r"\\.\pipe\Out_x",
            r"\\.\pipe\Err_x",
            r"Global\ReadyToWrite_x",
            r"Global\SvcDone_x",
        ])
    }

    #[test]
    fn handshake_selects_the_worker_role_in_session0() {
        match triage(&handshake_args(), true) {
            Invocation::Worker(handshake) => {
                assert_eq!(handshake.service_name, OsString::from("RunInSession0_x"));
                assert_eq!(handshake.done_event, OsString::from(r"Global\SvcDone_x"));
            }
            _ => panic!("expected the worker role"),
        }
    }

    #[test]
    fn handshake_outside_session0_falls_through_to_payload_args() {
        match triage(&handshake_args(), false) {
            Invocation::Cross { payload_args, .. } => {
                assert_eq!(payload_args.len(), 6);
                assert_eq!(payload_args[0], OsString::from(SERVICE_SWITCH));
            }
            _ => panic!("expected the originator role"),
        }
    }

    #[test]
    fn handshake_requires_the_exact_argument_count() {
        let mut short = handshake_args();
        short.pop();
        assert!(!matches!(triage(&short, true), Invocation::Worker(_)));

        let mut long = handshake_args();
        long.push("extra".into());
        assert!(!matches!(triage(&long, true), Invocation::Worker(_)));
    }

    #[test]
    fn here_runs_the_payload_in_process() {
        match triage(&args(&["app.exe", "-here", "-a"]), false) {
            Invocation::RunHere { payload_args } => {
                assert_eq!(payload_args, args(&["-a"]));
            }
            _ => panic!("expected in-process execution"),
        }
    }

    #[test]
    fn defaults_apply_when_no_flags_are_given() {
        match triage(&args(&["app.exe"]), false) {
            Invocation::Cross {
                deadline_secs,
                output_file,
                payload_args,
            } => {
                assert_eq!(deadline_secs, DEFAULT_DEADLINE_SECS);
                assert!(output_file.is_none());
                assert!(payload_args.is_empty());
            }
            _ => panic!("expected the originator role"),
        }
    }

    #[test]
    fn deadline_override_is_parsed() {
        match triage(&args(&["app.exe", "-t", "120", "-a"]), false) {
            Invocation::Cross {
                deadline_secs,
                payload_args,
                ..
            } => {
                assert_eq!(deadline_secs, 120);
                assert_eq!(payload_args, args(&["-a"]));
            }
            _ => panic!("expected the originator role"),
        }
    }

    #[test]
    fn zero_or_malformed_deadline_is_rejected() {
        for tokens in [
            &["app.exe", "-t", "0"][..],
            &["app.exe", "-t", "soon"],
            &["app.exe", "-t", "-5"],
            &["app.exe", "-t"],
        ] {
            assert!(matches!(
                triage(&args(tokens), false),
                Invocation::Usage { error: Some(_) }
            ));
        }
    }

    #[test]
    fn here_excludes_deadline_and_redirection() {
        for tokens in [
            &["app.exe", "-here", "-t", "5"][..],
            &["app.exe", "-o", "out.txt", "-here"],
        ] {
            assert!(matches!(
                triage(&args(tokens), false),
                Invocation::Usage { error: Some(_) }
            ));
        }
    }

    #[test]
    fn output_redirection_is_captured() {
        match triage(&args(&["app.exe", "-o", "out.txt", "-a"]), false) {
            Invocation::Cross {
                output_file,
                payload_args,
                ..
            } => {
                assert_eq!(output_file, Some(PathBuf::from("out.txt")));
                assert_eq!(payload_args, args(&["-a"]));
            }
            _ => panic!("expected the originator role"),
        }
    }

    #[test]
    fn first_unrecognised_token_starts_the_payload_arguments() {
        match triage(&args(&["app.exe", "-x", "-t", "5"]), false) {
            Invocation::Cross {
                deadline_secs,
                payload_args,
                ..
            } => {
                // "-t 5" after "-x" belongs to the payload, not the framework.
                assert_eq!(deadline_secs, DEFAULT_DEADLINE_SECS);
                assert_eq!(payload_args, args(&["-x", "-t", "5"]));
            }
            _ => panic!("expected the originator role"),
        }
    }

    #[test]
    fn help_tokens_print_usage() {
        for token in ["/?", "-?", "-help", "/help"] {
            assert!(matches!(
                triage(&args(&["app.exe", token]), false),
                Invocation::Usage { error: None }
            ));
        }
    }
}
