//! Loaded executable images and their PE headers

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::scan::Region;

/// Offset of `e_lfanew` in the DOS header
const E_LFANEW: usize = 0x3C;
/// Offset of `TimeDateStamp` from the NT headers
const TIME_DATE_STAMP: usize = 8;
/// Offset of the optional header from the NT headers
const OPTIONAL_HEADER: usize = 24;
/// Offset of `SizeOfImage` inside the optional header (same for PE32 and PE32+)
const SIZE_OF_IMAGE: usize = 56;
/// NT headers further in than this are considered corrupt
const MAX_HEADER_OFFSET: u32 = 0x1000;

/// Errors while describing a loaded image
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModuleError {
    /// No `MZ` signature at the base
    #[error("no DOS header at {0:#x}")]
    NoDosHeader(usize),
    /// `e_lfanew` points somewhere unreasonable
    #[error("NT header offset {0:#x} is out of range")]
    BadHeaderOffset(u32),
    /// No `PE\0\0` signature where the NT headers should be
    #[error("no NT headers at {0:#x}")]
    NoNtHeaders(usize),
    /// The image claims to be smaller than its own headers
    #[error("image size {0:#x} is smaller than its headers")]
    BadImageSize(u32),
    /// The OS couldn't tell us about the image
    #[error("couldn't query module: {0}")]
    Query(String),
}

/// An executable image mapped into the current process
#[derive(Debug, Clone)]
pub struct Module {
    /// File name, e.g. `TheGreatCircle.exe`
    name: String,
    /// Full path of the file the image was loaded from
    path: PathBuf,
    /// Load address
    base: usize,
    /// `SizeOfImage` from the optional header
    size: usize,
    /// Link time from the file header
    timestamp: u32,
}

impl Module {
    /// Reads the PE headers of the image mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at a mapped image (or something readable shaped like one) that stays
    /// mapped while the returned module is used
    pub unsafe fn from_base(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        base: usize,
    ) -> Result<Self, ModuleError> {
        let read_u16 = |offset: usize| ((base + offset) as *const u16).read_unaligned();
        let read_u32 = |offset: usize| ((base + offset) as *const u32).read_unaligned();

        if read_u16(0) != u16::from_le_bytes(*b"MZ") {
            return Err(ModuleError::NoDosHeader(base));
        }
        let nt_offset = read_u32(E_LFANEW);
        if nt_offset < 0x40 || nt_offset > MAX_HEADER_OFFSET {
            return Err(ModuleError::BadHeaderOffset(nt_offset));
        }
        let nt = nt_offset as usize;
        if read_u32(nt) != u32::from_le_bytes(*b"PE\0\0") {
            return Err(ModuleError::NoNtHeaders(base + nt));
        }
        let timestamp = read_u32(nt + TIME_DATE_STAMP);
        let size = read_u32(nt + OPTIONAL_HEADER + SIZE_OF_IMAGE);
        if (size as usize) < nt + OPTIONAL_HEADER + SIZE_OF_IMAGE + 4 {
            return Err(ModuleError::BadImageSize(size));
        }

        Ok(Self {
            name: name.into(),
            path: path.into(),
            base,
            size: size as usize,
            timestamp,
        })
    }

    /// The main executable of the current process
    #[cfg(windows)]
    pub fn process_image() -> Result<Self, ModuleError> {
        use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;

        // Safety: a null name asks for the process image, which is always loaded
        let handle = unsafe { GetModuleHandleW(std::ptr::null()) };
        if handle.is_null() {
            return Err(ModuleError::Query(std::io::Error::last_os_error().to_string()));
        }
        let path = module_path(handle as usize)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        // Safety: the process image stays mapped for the lifetime of the process
        unsafe { Self::from_base(name, path, handle as usize) }
    }

    /// File name of the image
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the image on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load address
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the mapped image
    pub fn size(&self) -> usize {
        self.size
    }

    /// PE link timestamp
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// The whole image as a scan region
    pub fn region(&self) -> Region {
        // Safety: `from_base` requires the image to stay mapped
        unsafe { Region::new(self.base, self.size) }
    }

    /// Offset of `address` from the load address
    pub fn rva(&self, address: usize) -> usize {
        address.wrapping_sub(self.base)
    }
}

/// Full path of the loaded module with the given handle
#[cfg(windows)]
pub fn module_path(handle: usize) -> Result<PathBuf, ModuleError> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;

    use windows_sys::Win32::System::LibraryLoader::GetModuleFileNameW;

    let mut buffer = vec![0u16; 260];
    loop {
        // Safety: the buffer is valid for its full length
        let len = unsafe {
            GetModuleFileNameW(handle as _, buffer.as_mut_ptr(), buffer.len() as u32)
        } as usize;
        if len == 0 {
            return Err(ModuleError::Query(std::io::Error::last_os_error().to_string()));
        }
        // a full buffer means the path was truncated
        if len < buffer.len() {
            return Ok(PathBuf::from(OsString::from_wide(&buffer[..len])));
        }
        buffer.resize(buffer.len() * 2, 0);
    }
}
