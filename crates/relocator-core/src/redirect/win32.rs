use std::ffi::c_void;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Security::{GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY};
use windows::Win32::Storage::FileSystem::{
    GetVolumeInformationW, GetVolumePathNameW, FILE_FLAG_BACKUP_SEMANTICS,
    FILE_FLAG_OPEN_REPARSE_POINT,
};
use windows::Win32::System::Ioctl::{
    FSCTL_DELETE_REPARSE_POINT, FSCTL_GET_REPARSE_POINT, FSCTL_SET_REPARSE_POINT,
};
use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
use windows::Win32::System::IO::DeviceIoControl;
use winreg::enums::HKEY_LOCAL_MACHINE;
use winreg::RegKey;

use super::reparse::{self, IO_REPARSE_TAG_MOUNT_POINT, MAXIMUM_REPARSE_DATA_BUFFER_SIZE};
use super::{RedirectError, RedirectInfo, RedirectKind, RedirectResult};

const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x400;
const FILE_SUPPORTS_REPARSE_POINTS: u32 = 0x80;
const JUNCTION_FILE_SYSTEMS: &[&str] = &["NTFS", "ReFS"];
const APP_MODEL_UNLOCK: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\AppModelUnlock";

pub(super) fn supports_junction(path: &Path) -> bool {
    match volume_file_system(path) {
        Ok((name, flags)) => {
            flags & FILE_SUPPORTS_REPARSE_POINTS != 0
                && JUNCTION_FILE_SYSTEMS
                    .iter()
                    .any(|fs| name.eq_ignore_ascii_case(fs))
        }
        Err(err) => {
            debug!(path = %path.display(), error = %err, "volume query failed");
            false
        }
    }
}

pub(super) fn supports_symbolic_link() -> bool {
    is_elevated() || developer_mode_enabled()
}

pub(super) fn create_junction(link: &Path, target: &Path) -> RedirectResult<()> {
    let target = target.to_str().ok_or_else(|| {
        RedirectError::InvalidArgument(format!("target is not valid unicode: {}", target.display()))
    })?;
    let buffer = reparse::encode_mount_point(target)?;

    fs::create_dir(link)?;
    if let Err(err) = set_reparse_point(link, &buffer) {
        if let Err(cleanup) = fs::remove_dir(link) {
            warn!(link = %link.display(), error = %cleanup, "failed to remove junction placeholder");
        }
        return Err(err.into());
    }
    Ok(())
}

pub(super) fn create_symbolic_link(link: &Path, target: &Path, is_dir: bool) -> RedirectResult<()> {
    if is_dir {
        std::os::windows::fs::symlink_dir(target, link)?;
    } else {
        std::os::windows::fs::symlink_file(target, link)?;
    }
    Ok(())
}

pub(super) fn remove_link(link: &Path) -> io::Result<bool> {
    let meta = match fs::symlink_metadata(link) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if meta.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT == 0 {
        return Ok(false);
    }

    let data = reparse::decode(&get_reparse_point(link)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    match data.kind() {
        Some(RedirectKind::Junction) => {
            delete_reparse_point(link, IO_REPARSE_TAG_MOUNT_POINT)?;
            fs::remove_dir(link)?;
        }
        Some(RedirectKind::SymbolicLink) => {
            if meta.file_type().is_symlink_dir() {
                fs::remove_dir(link)?;
            } else {
                fs::remove_file(link)?;
            }
        }
        None => return Ok(false),
    }
    Ok(true)
}

pub(super) fn inspect(path: &Path) -> io::Result<Option<RedirectInfo>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if meta.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT == 0 {
        return Ok(None);
    }

    let data = reparse::decode(&get_reparse_point(path)?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let Some(kind) = data.kind() else {
        return Ok(None);
    };

    let mut target_path = data.target();
    if data.relative {
        if let Some(parent) = path.parent() {
            target_path = parent.join(target_path);
        }
    }

    Ok(Some(RedirectInfo {
        link_path: path.to_path_buf(),
        target_exists: target_path.exists(),
        target_path,
        kind,
    }))
}

fn open_reparse_handle(path: &Path, write: bool) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .custom_flags(FILE_FLAG_OPEN_REPARSE_POINT.0 | FILE_FLAG_BACKUP_SEMANTICS.0)
        .open(path)
}

fn set_reparse_point(path: &Path, buffer: &[u8]) -> io::Result<()> {
    let file = open_reparse_handle(path, true)?;
    // SAFETY: the handle is owned by `file` for the duration of the call and the
    // input buffer outlives it.
    unsafe {
        DeviceIoControl(
            HANDLE(file.as_raw_handle()),
            FSCTL_SET_REPARSE_POINT,
            Some(buffer.as_ptr() as *const c_void),
            buffer.len() as u32,
            None,
            0,
            None,
            None,
        )
    }
    .map_err(win_error)
}

fn get_reparse_point(path: &Path) -> io::Result<Vec<u8>> {
    let file = open_reparse_handle(path, false)?;
    let mut buffer = vec![0u8; MAXIMUM_REPARSE_DATA_BUFFER_SIZE];
    let mut returned = 0u32;
    // SAFETY: output buffer is MAXIMUM_REPARSE_DATA_BUFFER_SIZE bytes as declared.
    unsafe {
        DeviceIoControl(
            HANDLE(file.as_raw_handle()),
            FSCTL_GET_REPARSE_POINT,
            None,
            0,
            Some(buffer.as_mut_ptr() as *mut c_void),
            buffer.len() as u32,
            Some(&mut returned as *mut u32),
            None,
        )
    }
    .map_err(win_error)?;
    buffer.truncate(returned as usize);
    Ok(buffer)
}

fn delete_reparse_point(path: &Path, tag: u32) -> io::Result<()> {
    let file = open_reparse_handle(path, true)?;
    let header = reparse::delete_header(tag);
    // SAFETY: header is a stack array that outlives the call.
    unsafe {
        DeviceIoControl(
            HANDLE(file.as_raw_handle()),
            FSCTL_DELETE_REPARSE_POINT,
            Some(header.as_ptr() as *const c_void),
            header.len() as u32,
            None,
            0,
            None,
            None,
        )
    }
    .map_err(win_error)
}

fn volume_file_system(path: &Path) -> io::Result<(String, u32)> {
    let existing = nearest_existing(path)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))?;
    let wide = to_wide(&existing);

    let mut volume = [0u16; 261];
    // SAFETY: `wide` is NUL terminated and lives across the call.
    unsafe { GetVolumePathNameW(PCWSTR(wide.as_ptr()), &mut volume) }.map_err(win_error)?;

    let mut flags = 0u32;
    let mut fs_name = [0u16; 261];
    // SAFETY: `volume` was NUL terminated by GetVolumePathNameW.
    unsafe {
        GetVolumeInformationW(
            PCWSTR(volume.as_ptr()),
            None,
            None,
            None,
            Some(&mut flags as *mut u32),
            Some(&mut fs_name),
        )
    }
    .map_err(win_error)?;

    let len = fs_name.iter().position(|&c| c == 0).unwrap_or(fs_name.len());
    Ok((String::from_utf16_lossy(&fs_name[..len]), flags))
}

fn is_elevated() -> bool {
    let mut token = HANDLE::default();
    // SAFETY: the pseudo handle from GetCurrentProcess needs no closing; `token`
    // is closed below.
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) }.is_err() {
        return false;
    }
    let mut elevation = TOKEN_ELEVATION::default();
    let mut returned = 0u32;
    // SAFETY: `elevation` is sized exactly as declared.
    let queried = unsafe {
        GetTokenInformation(
            token,
            TokenElevation,
            Some(&mut elevation as *mut TOKEN_ELEVATION as *mut c_void),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut returned,
        )
    };
    // SAFETY: token came from OpenProcessToken above.
    let _ = unsafe { CloseHandle(token) };
    queried.is_ok() && elevation.TokenIsElevated != 0
}

fn developer_mode_enabled() -> bool {
    RegKey::predef(HKEY_LOCAL_MACHINE)
        .open_subkey(APP_MODEL_UNLOCK)
        .and_then(|key| key.get_value::<u32, _>("AllowDevelopmentWithoutDevLicense"))
        .map(|v| v == 1)
        .unwrap_or(false)
}

fn nearest_existing(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(p) = current {
        if p.exists() {
            return Some(p.to_path_buf());
        }
        current = p.parent();
    }
    None
}

fn to_wide(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
}

fn win_error(err: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(err.code().0 & 0xFFFF)
}
