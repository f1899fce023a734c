use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::slice;

use crate::Error;

/// Handle to physical memory (`/dev/mem`).
///
/// Mapping windows of it requires root and a kernel that allows access to the
/// reserved DRAM region and the AXI-Lite register space.
#[derive(Debug)]
pub struct DevMem {
    file: File,
}

impl DevMem {
    pub fn open() -> Result<DevMem, Error> {
        DevMem::open_path("/dev/mem")
    }

    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<DevMem, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(Error::NoDeviceAccess)?;
        Ok(DevMem { file })
    }

    /// Maps `size` bytes of physical memory starting at `phys_addr`, which has
    /// to be page aligned.
    pub fn map(&self, name: &str, phys_addr: usize, size: usize) -> Result<MemoryMap, Error> {
        let base;
        unsafe {
            base = libc::mmap(
                std::ptr::null_mut::<libc::c_void>(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                phys_addr as libc::off_t,
            );
            if base == libc::MAP_FAILED {
                return Err(Error::Mmap);
            }
        }
        log::debug!("MAP {} {:#010x}/{:#x}", name, phys_addr, size);

        Ok(MemoryMap {
            name: name.to_string(),
            base: base as *mut u8,
            phys_addr,
            size,
            backing: Backing::Device,
        })
    }
}

enum Backing {
    Device,
    // u64 words keep the fake 8-byte aligned like a real page
    Anonymous(#[allow(dead_code)] Vec<u64>),
}

/// A contiguous window of physical memory mapped into the process.
///
/// All accesses go through offsets relative to the start of the window and
/// are bounds checked. The window is either backed by `/dev/mem` or, for
/// tests and dry runs, by anonymous heap memory that pretends to live at a
/// given physical address.
pub struct MemoryMap {
    name: String,
    base: *mut u8,
    phys_addr: usize,
    size: usize,
    backing: Backing,
}

impl fmt::Debug for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MemoryMap ({})", &self.name)?;
        writeln!(f, "  base: {:?}", &self.base)?;
        writeln!(f, "  phys_addr: {:#x?}", &self.phys_addr)?;
        write!(f, "  size: {:#x?}", &self.size)
    }
}

impl MemoryMap {
    /// Creates a zeroed in-memory region that reports `phys_addr` as its
    /// physical base address.
    pub fn anonymous(name: &str, phys_addr: usize, size: usize) -> MemoryMap {
        let mut words = vec![0u64; (size + 7) / 8];
        let base = words.as_mut_ptr() as *mut u8;
        MemoryMap {
            name: name.to_string(),
            base,
            phys_addr,
            size,
            backing: Backing::Anonymous(words),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), Error> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Physical address of the byte at `offset`.
    pub fn physical_of(&self, offset: usize) -> Result<usize, Error> {
        self.check(offset, 1)?;
        Ok(self.phys_addr + offset)
    }

    /// Offset of the physical address `phys` inside this window.
    pub fn offset_of(&self, phys: usize) -> Result<usize, Error> {
        if phys < self.phys_addr || phys - self.phys_addr >= self.size {
            return Err(Error::AddressOutOfRange(phys));
        }
        Ok(phys - self.phys_addr)
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Raw pointer to the byte at `offset`, valid as long as the map lives.
    pub fn ptr_at(&self, offset: usize, len: usize) -> Result<*mut u8, Error> {
        self.check(offset, len)?;
        Ok(unsafe { self.base.add(offset) })
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.size);
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset % 4 == 0 && offset + 4 <= self.size);
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), Error> {
        self.check(offset, data.len())?;
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(offset), data.len());
        }
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, data: &mut [u8]) -> Result<(), Error> {
        self.check(offset, data.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), data.as_mut_ptr(), data.len());
        }
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<(), Error> {
        self.check(offset, len)?;
        unsafe {
            ptr::write_bytes(self.base.add(offset), value, len);
        }
        Ok(())
    }

    /// Reads from `input` straight into `[offset, offset + len)` until the
    /// span is full or the reader is exhausted. Returns the bytes copied.
    pub fn load_from<R: Read>(
        &self,
        offset: usize,
        len: usize,
        input: &mut R,
    ) -> Result<usize, Error> {
        self.check(offset, len)?;
        let dst = unsafe { slice::from_raw_parts_mut(self.base.add(offset), len) };
        let mut filled = 0;
        while filled < len {
            match input.read(&mut dst[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }
}

impl Drop for MemoryMap {
    fn drop(&mut self) {
        if let Backing::Device = self.backing {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}

// Writes go through raw pointers into memory shared with the FPGA. Who may
// write which part at what time is decided by the simulator's enable/disable
// protocol, not by the type system.
unsafe impl Send for MemoryMap {}
unsafe impl Sync for MemoryMap {}
