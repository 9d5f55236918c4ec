use windows::Win32::Foundation::{HANDLE, HLOCAL, LocalFree};
use windows::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
use windows::Win32::Storage::FileSystem::{FILE_FLAG_FIRST_PIPE_INSTANCE, PIPE_ACCESS_INBOUND};
use windows::Win32::System::Pipes::{CreateNamedPipeW, PIPE_TYPE_BYTE};

use crate::win::{Handle, WideString};

/// Security descriptor parsed from SDDL, owning the allocation made by the
/// parser until drop.
pub(crate) struct SecurityDescriptor {
    descriptor: PSECURITY_DESCRIPTOR,
}

impl SecurityDescriptor {
    pub(crate) fn from_sddl(sddl: &str) -> windows::core::Result<Self> {
        let wide = WideString::new(sddl);
        let mut descriptor = PSECURITY_DESCRIPTOR::default();
        // SAFETY: `wide` outlives the call; the out pointer is a valid local.
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                wide.as_pcwstr(),
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )?;
        }
        Ok(Self { descriptor })
    }

    /// Attributes applying this descriptor to a new kernel object, with
    /// handle inheritance disabled.
    pub(crate) fn attributes(&self) -> SECURITY_ATTRIBUTES {
        SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: self.descriptor.0,
            bInheritHandle: false.into(),
        }
    }
}

impl Drop for SecurityDescriptor {
    fn drop(&mut self) {
        // SAFETY: the descriptor was allocated by
        // ConvertStringSecurityDescriptorToSecurityDescriptorW and must be
        // released with LocalFree.
        let _ = unsafe { LocalFree(Some(HLOCAL(self.descriptor.0))) };
    }
}

/// Server end of an inbound byte-mode named pipe.
///
/// Single instance, created with first-instance semantics so a second pipe
/// under the same name fails instead of silently splitting the stream.
pub(crate) struct InboundPipe {
    handle: Handle,
}

impl InboundPipe {
    pub(crate) fn create(
        name: &str,
        descriptor: &SecurityDescriptor,
    ) -> windows::core::Result<Self> {
        let wide = WideString::new(name);
        let attributes = descriptor.attributes();

        // SAFETY: `wide` and `attributes` outlive the call; the kernel copies
        // the security descriptor into the new object.
        let raw = unsafe {
            CreateNamedPipeW(
                wide.as_pcwstr(),
                PIPE_ACCESS_INBOUND | FILE_FLAG_FIRST_PIPE_INSTANCE,
                PIPE_TYPE_BYTE,
                1,
                0,
                0,
                0,
                Some(&attributes as *const SECURITY_ATTRIBUTES),
            )
        };

        // `windows` crate API inconsistency: CreateNamedPipeW reports failure
        // through an invalid handle instead of Result::Err.
        if raw.is_invalid() {
            return Err(windows::core::Error::from_win32());
        }

        // SAFETY: the handle is valid and we are its only owner.
        Ok(Self {
            handle: unsafe { Handle::new_owned(raw) },
        })
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.handle.raw()
    }
}
