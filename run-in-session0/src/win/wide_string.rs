use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;

use windows::core::PCWSTR;

/// NUL-terminated UTF-16 buffer for passing names to wide-character APIs.
#[derive(Default, Debug)]
pub(crate) struct WideString(Vec<u16>);

impl WideString {
    pub(crate) fn new(s: &str) -> Self {
        let mut buf = s.encode_utf16().collect::<Vec<_>>();
        buf.push(0);
        Self(buf)
    }

    pub(crate) fn from_os(s: &OsStr) -> Self {
        let buf = s.encode_wide().chain(std::iter::once(0)).collect();
        Self(buf)
    }

    pub(crate) fn as_pcwstr(&self) -> PCWSTR {
        PCWSTR::from_raw(self.0.as_ptr())
    }
}
