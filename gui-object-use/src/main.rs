//! Lists processes in session 0 and the USER/GDI resources they use, running
//! the enumeration as LocalSystem through the run-in-session0 framework.

mod payload;
mod procinfo;

use std::fmt;
use std::time::Instant;

use run_in_session0::{dispatch, UsageText};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

/// Custom timer that formats uptime with millisecond precision (3 decimal places).
struct MillisTimer {
    start: Instant,
}

impl MillisTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl FormatTime for MillisTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let elapsed = self.start.elapsed();
        let secs = elapsed.as_secs_f64();
        write!(w, "{:8.3}s", secs)
    }
}

const USAGE: UsageText = UsageText {
    description: concat!(
        "    Lists processes in session 0 and the numbers of USER and GDI\n",
        "    resources they've used, as tab-delimited text with headers.\n",
        "    Requires administrative rights.\n",
        "    To inspect processes in the current session, use the -here\n",
        "    command line option."
    ),
    payload_params: concat!(
        "  -a : Show information about all processes, including processes\n",
        "       with no USER/GDI objects and/or that cannot be opened.\n",
        "       By default, processes with no USER or GDI objects or that\n",
        "       cannot be opened are not listed."
    ),
};

fn main() {
    // Diagnostics go to stderr so the report on stdout stays clean; in the
    // worker role stderr is the error pipe, so they still reach the user.
    tracing_subscriber::fmt()
        .with_level(true)
        .with_timer(MillisTimer::new())
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        git_commit = env!("GIT_HASH"),
        built_at = env!("BUILD_TIMESTAMP"),
        "gui-object-use"
    );

    std::process::exit(dispatch(payload::gui_object_use, &USAGE));
}
