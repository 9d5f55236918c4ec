//! The payload proper: enumerates the processes of the current
//! terminal-services session and reports their USER/GDI object usage as
//! tab-delimited text on stdout. When transported into Session 0 by the
//! framework, "current session" is Session 0.

use std::ffi::{c_void, OsString};

use run_in_session0::current_session_id;
use windows::core::PWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::RemoteDesktop::{
    WTSEnumerateProcessesExW, WTSFreeMemoryExW, WTSTypeProcessInfoLevel0, WTS_PROCESS_INFOW,
};
use windows::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};
use windows::Win32::UI::WindowsAndMessaging::{
    GetGuiResources, GR_GDIOBJECTS, GR_GDIOBJECTS_PEAK, GR_USEROBJECTS, GR_USEROBJECTS_PEAK,
};

use crate::procinfo::{parent_map, services_by_pid, sid_display};

const HEADER: &str = "Session\tPID\tProcess name\tPPID\tServices\tUser SID\tUser name\t\
                      USER objects\tUSER objects peak\tGDI objects\tGDI objects peak";

/// Entry point handed to the framework.
pub fn gui_object_use(args: &[OsString]) -> i32 {
    let mut show_all = false;
    for arg in args {
        match arg.to_str() {
            Some("-a") => show_all = true,
            _ => {
                eprintln!(
                    "Unrecognized command line option: {}",
                    arg.to_string_lossy()
                );
                return -1;
            }
        }
    }

    let Some(session_id) = current_session_id() else {
        eprintln!("Unable to retrieve current TS session ID");
        return -1;
    };

    let processes = match enumerate_session_processes(session_id) {
        Ok(processes) => processes,
        Err(err) => {
            eprintln!("Process enumeration for session {session_id} failed: {err}");
            return -2;
        }
    };

    let parents = parent_map();
    let services = services_by_pid();

    println!("{HEADER}");

    let mut totals = GuiCounts::default();
    for process in &processes {
        // PID 0 is not a real process.
        if process.pid == 0 {
            continue;
        }

        let hosted_services = services.get(&process.pid).cloned().unwrap_or_default();

        // SAFETY: a handle from OpenProcess is closed right after the queries.
        match unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, process.pid) } {
            Ok(handle) => {
                let counts = gui_counts(handle);
                let ppid = parents
                    .get(&process.pid)
                    .map(|ppid| ppid.to_string())
                    .unwrap_or_default();
                // SAFETY: we own the handle.
                let _ = unsafe { CloseHandle(handle) };

                totals.add(&counts);

                if show_all || counts.any_nonzero() {
                    println!("{}", process.row(&ppid, &hosted_services, &counts).line());
                }
            }
            Err(err) => {
                // Only worth a row when everything was asked for.
                if show_all {
                    let code = err.code().0 as u32 & 0xFFFF;
                    let text = err.message().trim_end().to_string();
                    println!(
                        "{}",
                        process
                            .error_row(&hosted_services, &format!("Error {code}"), &text)
                            .line()
                    );
                }
            }
        }
    }

    // Totals over the processes that could be opened.
    println!(
        "{}",
        Row {
            session: session_id,
            pid: "TOTAL".into(),
            name: "[enumerated processes]".into(),
            counts: totals.to_columns(),
            ..Row::blank(session_id)
        }
        .line()
    );

    // Session-wide usage through the GR_GLOBAL pseudo-handle.
    let global = gui_counts(gr_global());
    println!(
        "{}",
        Row {
            session: session_id,
            pid: "GR_GLOBAL".into(),
            name: "[Session-wide usage]".into(),
            counts: global.to_columns(),
            ..Row::blank(session_id)
        }
        .line()
    );

    0
}

/// USER/GDI object counters of one process.
#[derive(Default)]
struct GuiCounts {
    user: u32,
    user_peak: u32,
    gdi: u32,
    gdi_peak: u32,
}

impl GuiCounts {
    fn any_nonzero(&self) -> bool {
        self.user > 0 || self.user_peak > 0 || self.gdi > 0 || self.gdi_peak > 0
    }

    fn add(&mut self, other: &GuiCounts) {
        self.user += other.user;
        self.user_peak += other.user_peak;
        self.gdi += other.gdi;
        self.gdi_peak += other.gdi_peak;
    }

    fn to_columns(&self) -> [String; 4] {
        [
            self.user.to_string(),
            self.user_peak.to_string(),
            self.gdi.to_string(),
            self.gdi_peak.to_string(),
        ]
    }
}

fn gui_counts(process: HANDLE) -> GuiCounts {
    // SAFETY: GetGuiResources tolerates any process handle value and returns
    // zero on failure, which is also what the report shows for such rows.
    unsafe {
        GuiCounts {
            user: GetGuiResources(process, GR_USEROBJECTS),
            user_peak: GetGuiResources(process, GR_USEROBJECTS_PEAK),
            gdi: GetGuiResources(process, GR_GDIOBJECTS),
            gdi_peak: GetGuiResources(process, GR_GDIOBJECTS_PEAK),
        }
    }
}

/// The GR_GLOBAL pseudo-handle, which GetGuiResources accepts for
/// session-wide counters.
fn gr_global() -> HANDLE {
    HANDLE(-2isize as *mut c_void)
}

/// One process as returned by the WTS enumeration, with the owner identity
/// already resolved so nothing borrows the WTS buffer after it is freed.
struct SessionProcess {
    session: u32,
    pid: u32,
    name: String,
    sid: String,
    account: String,
}

impl SessionProcess {
    fn row(&self, ppid: &str, services: &str, counts: &GuiCounts) -> Row {
        Row {
            session: self.session,
            pid: self.pid.to_string(),
            name: self.name.clone(),
            ppid: ppid.into(),
            services: services.into(),
            sid: self.sid.clone(),
            account: self.account.clone(),
            counts: counts.to_columns(),
        }
    }

    fn error_row(&self, services: &str, code: &str, message: &str) -> Row {
        Row {
            session: self.session,
            pid: self.pid.to_string(),
            name: self.name.clone(),
            ppid: String::new(),
            services: services.into(),
            sid: self.sid.clone(),
            account: self.account.clone(),
            counts: [code.into(), message.into(), code.into(), message.into()],
        }
    }
}

/// One output line of the report.
struct Row {
    session: u32,
    pid: String,
    name: String,
    ppid: String,
    services: String,
    sid: String,
    account: String,
    counts: [String; 4],
}

impl Row {
    fn blank(session: u32) -> Self {
        Self {
            session,
            pid: String::new(),
            name: String::new(),
            ppid: String::new(),
            services: String::new(),
            sid: String::new(),
            account: String::new(),
            counts: Default::default(),
        }
    }

    fn line(&self) -> String {
        [
            self.session.to_string(),
            self.pid.clone(),
            self.name.clone(),
            self.ppid.clone(),
            self.services.clone(),
            self.sid.clone(),
            self.account.clone(),
            self.counts[0].clone(),
            self.counts[1].clone(),
            self.counts[2].clone(),
            self.counts[3].clone(),
        ]
        .join("\t")
    }
}

fn enumerate_session_processes(
    session_id: u32,
) -> windows::core::Result<Vec<SessionProcess>> {
    let mut level = 0u32;
    let mut buffer = PWSTR::null();
    let mut count = 0u32;

    // SAFETY: out pointers are valid locals; the returned buffer holds
    // `count` level-0 entries and is released with the matching
    // WTSFreeMemoryExW before the function returns.
    unsafe {
        WTSEnumerateProcessesExW(None, &mut level, session_id, &mut buffer, &mut count)?;

        let entries =
            std::slice::from_raw_parts(buffer.0 as *const WTS_PROCESS_INFOW, count as usize);
        let processes = entries
            .iter()
            .map(|entry| {
                let (sid, account) = sid_display(entry.pUserSid);
                let name = if entry.pProcessName.is_null() {
                    String::new()
                } else {
                    entry.pProcessName.to_string().unwrap_or_default()
                };
                SessionProcess {
                    session: entry.SessionId,
                    pid: entry.ProcessId,
                    name,
                    sid,
                    account,
                }
            })
            .collect();

        let _ = WTSFreeMemoryExW(WTSTypeProcessInfoLevel0, buffer.0.cast(), count);
        Ok(processes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_has_one_label_per_row_column() {
        let row = Row::blank(0).line();
        assert_eq!(
            HEADER.split('\t').count(),
            row.split('\t').count(),
        );
    }

    #[test]
    fn header_leads_with_session_and_pid() {
        let mut columns = HEADER.split('\t');
        assert_eq!(columns.next(), Some("Session"));
        assert_eq!(columns.next(), Some("PID"));
        assert_eq!(columns.next_back(), Some("GDI objects peak"));
    }

    #[test]
    fn rows_are_tab_delimited_in_column_order() {
        let process = SessionProcess {
            session: 0,
            pid: 4242,
            name: "svchost.exe".into(),
            sid: "S-1-5-18".into(),
            account: r"NT AUTHORITY\SYSTEM".into(),
        };
        let counts = GuiCounts {
            user: 1,
            user_peak: 2,
            gdi: 3,
            gdi_peak: 4,
        };
        let line = process.row("612", "Schedule", &counts).line();
        assert_eq!(
            line,
            "0\t4242\tsvchost.exe\t612\tSchedule\tS-1-5-18\tNT AUTHORITY\\SYSTEM\t1\t2\t3\t4"
        );
    }

    #[test]
    fn error_rows_repeat_the_error_in_both_count_pairs() {
        let process = SessionProcess {
            session: 0,
            pid: 4,
            name: "System".into(),
            sid: String::new(),
            account: String::new(),
        };
        let line = process
            .error_row("", "Error 5", "Access is denied.")
            .line();
        assert!(line.ends_with(
            "\tError 5\tAccess is denied.\tError 5\tAccess is denied."
        ));
    }

    #[test]
    fn totals_accumulate_per_counter() {
        let mut totals = GuiCounts::default();
        totals.add(&GuiCounts {
            user: 1,
            user_peak: 5,
            gdi: 10,
            gdi_peak: 20,
        });
        totals.add(&GuiCounts {
            user: 2,
            user_peak: 1,
            gdi: 1,
            gdi_peak: 1,
        });
        assert_eq!(totals.to_columns(), ["3", "6", "11", "21"]);
        assert!(totals.any_nonzero());
        assert!(!GuiCounts::default().any_nonzero());
    }
}
