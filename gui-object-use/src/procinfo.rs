//! Process metadata lookups backing the report: parent PIDs, hosted service
//! names, and owner identity. Every lookup degrades to empty output rather
//! than failing the enumeration.

use std::collections::HashMap;

use tracing::warn;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HLOCAL, LocalFree};
use windows::Win32::Security::Authorization::ConvertSidToStringSidW;
use windows::Win32::Security::{LookupAccountSidW, PSID, SID_NAME_USE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Services::{
    CloseServiceHandle, EnumServicesStatusExW, OpenSCManagerW, ENUM_SERVICE_STATUS_PROCESSW,
    SC_ENUM_PROCESS_INFO, SC_MANAGER_ENUMERATE_SERVICE, SERVICE_STATE_ALL, SERVICE_WIN32,
};

/// Maps every PID on the machine to its parent PID, from one toolhelp
/// snapshot.
pub(crate) fn parent_map() -> HashMap<u32, u32> {
    let mut map = HashMap::new();

    // SAFETY: the snapshot handle is closed below; PROCESSENTRY32W is plain
    // data with dwSize set before the first call.
    unsafe {
        let snapshot = match CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "process snapshot failed; PPID column will be empty");
                return map;
            }
        };

        let mut entry = PROCESSENTRY32W::default();
        entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;

        if Process32FirstW(snapshot, &mut entry).is_ok() {
            loop {
                map.insert(entry.th32ProcessID, entry.th32ParentProcessID);
                if Process32NextW(snapshot, &mut entry).is_err() {
                    break;
                }
            }
        }

        let _ = CloseHandle(snapshot);
    }

    map
}

/// Maps PIDs to the space-separated names of the services they host, from one
/// SCM enumeration sweep.
pub(crate) fn services_by_pid() -> HashMap<u32, String> {
    let mut map: HashMap<u32, String> = HashMap::new();

    // SAFETY: the SCM handle is closed below; the enumeration buffer outlives
    // both calls and is only reinterpreted at the alignment the API wrote it.
    unsafe {
        let manager = match OpenSCManagerW(
            PCWSTR::null(),
            PCWSTR::null(),
            SC_MANAGER_ENUMERATE_SERVICE,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "cannot open the SCM; services column will be empty");
                return map;
            }
        };

        let mut bytes_needed = 0u32;
        let mut count = 0u32;
        let mut resume = 0u32;

        // First call sizes the buffer.
        let _ = EnumServicesStatusExW(
            manager,
            SC_ENUM_PROCESS_INFO,
            SERVICE_WIN32,
            SERVICE_STATE_ALL,
            None,
            &mut bytes_needed,
            &mut count,
            Some(&mut resume),
            PCWSTR::null(),
        );

        // u64 backing keeps the buffer aligned for the structs the SCM
        // writes into it.
        let mut buffer = vec![0u64; (bytes_needed as usize).div_ceil(8)];
        let bytes = std::slice::from_raw_parts_mut(
            buffer.as_mut_ptr() as *mut u8,
            bytes_needed as usize,
        );
        resume = 0;

        match EnumServicesStatusExW(
            manager,
            SC_ENUM_PROCESS_INFO,
            SERVICE_WIN32,
            SERVICE_STATE_ALL,
            Some(bytes),
            &mut bytes_needed,
            &mut count,
            Some(&mut resume),
            PCWSTR::null(),
        ) {
            Ok(()) => {
                let services = std::slice::from_raw_parts(
                    buffer.as_ptr() as *const ENUM_SERVICE_STATUS_PROCESSW,
                    count as usize,
                );
                for service in services {
                    let pid = service.ServiceStatusProcess.dwProcessId;
                    if pid == 0 {
                        continue;
                    }
                    let name = PCWSTR(service.lpServiceName.0)
                        .to_string()
                        .unwrap_or_default();
                    map.entry(pid)
                        .and_modify(|list| {
                            list.push(' ');
                            list.push_str(&name);
                        })
                        .or_insert(name);
                }
            }
            Err(err) => warn!(error = %err, "service enumeration failed"),
        }

        let _ = CloseServiceHandle(manager);
    }

    map
}

/// Renders a process owner SID as its string form and as `DOMAIN\user`.
/// Either half comes back empty when the lookup fails.
pub(crate) fn sid_display(sid: PSID) -> (String, String) {
    if sid.0.is_null() {
        return (String::new(), String::new());
    }

    // SAFETY: `sid` points at a SID owned by the WTS process buffer, which
    // the caller keeps alive across this call; the converted string is
    // released with LocalFree as the API requires.
    let sid_string = unsafe {
        let mut wide = PWSTR::null();
        match ConvertSidToStringSidW(sid, &mut wide) {
            Ok(()) => {
                let text = wide.to_string().unwrap_or_default();
                let _ = LocalFree(Some(HLOCAL(wide.0.cast())));
                text
            }
            Err(_) => String::new(),
        }
    };

    // SAFETY: fixed-size out buffers with matching length parameters.
    let account = unsafe {
        let mut name = [0u16; 256];
        let mut name_len = name.len() as u32;
        let mut domain = [0u16; 256];
        let mut domain_len = domain.len() as u32;
        let mut sid_use = SID_NAME_USE::default();
        match LookupAccountSidW(
            PCWSTR::null(),
            sid,
            Some(PWSTR(name.as_mut_ptr())),
            &mut name_len,
            Some(PWSTR(domain.as_mut_ptr())),
            &mut domain_len,
            &mut sid_use,
        ) {
            Ok(()) => format!(
                "{}\\{}",
                String::from_utf16_lossy(&domain[..domain_len as usize]),
                String::from_utf16_lossy(&name[..name_len as usize]),
            ),
            Err(_) => String::new(),
        }
    };

    (sid_string, account)
}
