//! Host memory backing the code buffer
//!
//! The code buffer only needs a fixed-size byte region and a way to make
//! freshly written bytes visible to instruction fetch. Native builds map an
//! anonymous read/write/execute region; everywhere else a plain heap buffer
//! is used and the emitted bytes are never executed directly.

/// Fill pattern for unused code memory (makes stray jumps easy to spot)
const FILL_BYTE: u8 = 0xCD;

/// Fixed-capacity region that holds emitted host code
pub trait CodeMemory {
    fn capacity(&self) -> usize;

    fn as_slice(&self) -> &[u8];

    fn as_mut_slice(&mut self) -> &mut [u8];

    fn as_ptr(&self) -> *const u8 {
        self.as_slice().as_ptr()
    }

    /// Make `len` bytes at `offset` coherent for instruction fetch
    fn flush_icache(&mut self, _offset: usize, _len: usize) {}
}

/// Heap-backed code memory (not executable)
pub struct HeapCodeMemory {
    bytes: Vec<u8>,
}

impl HeapCodeMemory {
    pub fn new(size: usize) -> Self {
        HeapCodeMemory {
            bytes: vec![FILL_BYTE; size],
        }
    }
}

impl CodeMemory for HeapCodeMemory {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")
))]
mod exec {
    use super::{CodeMemory, FILL_BYTE};
    use std::io;
    use std::ptr::NonNull;

    #[cfg(target_arch = "aarch64")]
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }

    /// Anonymous RWX mapping
    pub struct ExecutableMemory {
        ptr: NonNull<u8>,
        /// Usable size requested by the caller
        len: usize,
        /// Mapped size (rounded up to the page size)
        mapped: usize,
    }

    impl ExecutableMemory {
        pub fn new(size: usize) -> io::Result<Self> {
            let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let page = if page > 0 { page as usize } else { 4096 };
            let mapped = size.max(1).div_ceil(page) * page;

            let raw = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    mapped,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            let ptr = NonNull::new(raw as *mut u8)
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

            unsafe { std::ptr::write_bytes(ptr.as_ptr(), FILL_BYTE, mapped) };

            Ok(ExecutableMemory { ptr, len: size, mapped })
        }
    }

    impl CodeMemory for ExecutableMemory {
        fn capacity(&self) -> usize {
            self.len
        }

        fn as_slice(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }

        fn as_mut_slice(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
        }

        fn as_ptr(&self) -> *const u8 {
            self.ptr.as_ptr()
        }

        #[allow(unused_variables)]
        fn flush_icache(&mut self, offset: usize, len: usize) {
            // x86 keeps I/D caches coherent for self-modifying code
            #[cfg(target_arch = "aarch64")]
            unsafe {
                let start = self.ptr.as_ptr().add(offset) as *mut libc::c_char;
                __clear_cache(start, start.add(len));
            }
        }
    }

    impl Drop for ExecutableMemory {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.mapped);
            }
        }
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")
))]
pub use exec::ExecutableMemory;

/// Allocate the best code memory available on this host
pub fn allocate_code_memory(size: usize) -> Box<dyn CodeMemory> {
    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")
    ))]
    {
        match ExecutableMemory::new(size) {
            Ok(mem) => return Box::new(mem),
            Err(e) => {
                crate::console_warn!("Couldn't map executable code cache ({}), using heap memory", e);
            }
        }
    }
    Box::new(HeapCodeMemory::new(size))
}
