use std::ptr;

use crate::error::EngineError;

/// A page-backed copy of emitted machine code. Pages are mapped writable,
/// filled, then flipped to read+execute; they are unmapped on drop, which is
/// what invalidates a compiled function.
pub(crate) struct ExecutableMemory {
    ptr: *mut u8,
    size: usize,
}

impl ExecutableMemory {
    pub(crate) fn new(code: &[u8]) -> Result<Self, EngineError> {
        let page = 4096usize;
        let size = (code.len().max(1) + page - 1) & !(page - 1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(EngineError::Management(
                "mmap for the JIT code buffer failed".to_string(),
            ));
        }
        let ptr = ptr as *mut u8;
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_EXEC)
                != 0
            {
                libc::munmap(ptr as *mut libc::c_void, size);
                return Err(EngineError::Management(
                    "mprotect(rx) for the JIT code buffer failed".to_string(),
                ));
            }
        }
        Ok(ExecutableMemory { ptr, size })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}
