//! Packing and unpacking of `REPARSE_DATA_BUFFER` structures
//!
//! Layout (little endian):
//!
//! ```text
//! u32 ReparseTag | u16 ReparseDataLength | u16 Reserved
//! mount point: u16 SubstituteNameOffset | u16 SubstituteNameLength
//!              u16 PrintNameOffset      | u16 PrintNameLength | PathBuffer
//! symlink:     same four fields | u32 Flags | PathBuffer
//! ```
//!
//! Offsets and lengths are in bytes relative to PathBuffer. Every offset is
//! bounds-checked before a slice is taken.

use std::path::{Path, PathBuf};

use super::{RedirectError, RedirectKind, RedirectResult};

pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xA000_0003;
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;
pub const SYMLINK_FLAG_RELATIVE: u32 = 0x1;
pub const MAXIMUM_REPARSE_DATA_BUFFER_SIZE: usize = 16 * 1024;

const HEADER_LEN: usize = 8;
const MOUNT_POINT_FIELDS_LEN: usize = 8;
const SYMLINK_FIELDS_LEN: usize = 12;

const NT_PREFIX: &str = r"\??\";
const NT_UNC_PREFIX: &str = r"\??\UNC\";
const VERBATIM_PREFIX: &str = r"\\?\";
const VERBATIM_UNC_PREFIX: &str = r"\\?\UNC\";

/// Decoded reparse buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReparseData {
    pub tag: u32,
    pub substitute_name: String,
    pub print_name: String,
    pub relative: bool,
}

impl ReparseData {
    /// `None` for reparse tags that are not redirects (dedup, cloud files, ...).
    pub fn kind(&self) -> Option<RedirectKind> {
        match self.tag {
            IO_REPARSE_TAG_MOUNT_POINT => Some(RedirectKind::Junction),
            IO_REPARSE_TAG_SYMLINK => Some(RedirectKind::SymbolicLink),
            _ => None,
        }
    }

    /// Target in Win32 form, derived from the substitute name.
    pub fn target(&self) -> PathBuf {
        if self.relative {
            return PathBuf::from(&self.substitute_name);
        }
        let name = &self.substitute_name;
        if let Some(rest) = name.strip_prefix(NT_UNC_PREFIX) {
            PathBuf::from(format!(r"\\{}", rest))
        } else if let Some(rest) = name.strip_prefix(NT_PREFIX) {
            PathBuf::from(rest)
        } else if !self.print_name.is_empty() {
            PathBuf::from(&self.print_name)
        } else {
            PathBuf::from(name)
        }
    }
}

/// Drop a `\\?\` verbatim prefix, as returned by `canonicalize` on Windows.
pub fn strip_verbatim(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if let Some(rest) = text.strip_prefix(VERBATIM_UNC_PREFIX) {
        PathBuf::from(format!(r"\\{}", rest))
    } else if let Some(rest) = text.strip_prefix(VERBATIM_PREFIX) {
        PathBuf::from(rest)
    } else {
        path.to_path_buf()
    }
}

/// NT-namespace substitute name for an absolute Win32 target path.
pub fn substitute_name(target: &str) -> String {
    let plain = strip_verbatim(Path::new(target));
    let plain = plain.to_string_lossy();
    if let Some(rest) = plain.strip_prefix(r"\\") {
        format!("{}{}", NT_UNC_PREFIX, rest)
    } else {
        format!("{}{}", NT_PREFIX, plain)
    }
}

/// Build a mount-point (junction) reparse buffer for `target`.
pub fn encode_mount_point(target: &str) -> RedirectResult<Vec<u8>> {
    if target.is_empty() {
        return Err(RedirectError::InvalidArgument("junction target is empty".into()));
    }
    let substitute: Vec<u16> = substitute_name(target).encode_utf16().collect();
    let print: Vec<u16> = strip_verbatim(Path::new(target))
        .to_string_lossy()
        .encode_utf16()
        .collect();

    let substitute_bytes = substitute.len() * 2;
    let print_bytes = print.len() * 2;
    // both names are NUL terminated inside PathBuffer
    let path_buffer_len = substitute_bytes + 2 + print_bytes + 2;
    let data_len = MOUNT_POINT_FIELDS_LEN + path_buffer_len;
    if HEADER_LEN + data_len > MAXIMUM_REPARSE_DATA_BUFFER_SIZE {
        return Err(RedirectError::InvalidArgument(format!(
            "junction target too long: {}",
            target
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + data_len);
    buf.extend_from_slice(&IO_REPARSE_TAG_MOUNT_POINT.to_le_bytes());
    buf.extend_from_slice(&(data_len as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&(substitute_bytes as u16).to_le_bytes());
    buf.extend_from_slice(&((substitute_bytes + 2) as u16).to_le_bytes());
    buf.extend_from_slice(&(print_bytes as u16).to_le_bytes());
    for unit in substitute.iter().chain(std::iter::once(&0)) {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    for unit in print.iter().chain(std::iter::once(&0)) {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(buf)
}

/// Header-only buffer accepted by `FSCTL_DELETE_REPARSE_POINT`.
pub fn delete_header(tag: u32) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[..4].copy_from_slice(&tag.to_le_bytes());
    buf
}

/// Parse a reparse buffer as returned by `FSCTL_GET_REPARSE_POINT`.
pub fn decode(buf: &[u8]) -> RedirectResult<ReparseData> {
    if buf.len() < HEADER_LEN {
        return Err(invalid(format!("buffer of {} bytes has no header", buf.len())));
    }
    let tag = read_u32(buf, 0)?;
    let data_len = read_u16(buf, 4)? as usize;
    if HEADER_LEN + data_len > buf.len() {
        return Err(invalid(format!(
            "declared data length {} exceeds buffer of {} bytes",
            data_len,
            buf.len()
        )));
    }
    let data = &buf[HEADER_LEN..HEADER_LEN + data_len];

    let fields_len = match tag {
        IO_REPARSE_TAG_MOUNT_POINT => MOUNT_POINT_FIELDS_LEN,
        IO_REPARSE_TAG_SYMLINK => SYMLINK_FIELDS_LEN,
        _ => {
            return Ok(ReparseData {
                tag,
                substitute_name: String::new(),
                print_name: String::new(),
                relative: false,
            })
        }
    };
    if data.len() < fields_len {
        return Err(invalid(format!("reparse data too short for tag {:#x}", tag)));
    }

    let substitute_offset = read_u16(data, 0)? as usize;
    let substitute_len = read_u16(data, 2)? as usize;
    let print_offset = read_u16(data, 4)? as usize;
    let print_len = read_u16(data, 6)? as usize;
    let relative = if tag == IO_REPARSE_TAG_SYMLINK {
        read_u32(data, 8)? & SYMLINK_FLAG_RELATIVE != 0
    } else {
        false
    };

    let path_buffer = &data[fields_len..];
    Ok(ReparseData {
        tag,
        substitute_name: read_name(path_buffer, substitute_offset, substitute_len)?,
        print_name: read_name(path_buffer, print_offset, print_len)?,
        relative,
    })
}

fn read_name(path_buffer: &[u8], offset: usize, len: usize) -> RedirectResult<String> {
    if offset % 2 != 0 || len % 2 != 0 {
        return Err(invalid(format!("unaligned name at offset {} length {}", offset, len)));
    }
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= path_buffer.len())
        .ok_or_else(|| {
            invalid(format!(
                "name at offset {} length {} exceeds path buffer of {} bytes",
                offset,
                len,
                path_buffer.len()
            ))
        })?;
    let units: Vec<u16> = path_buffer[offset..end]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| invalid(e.to_string()))
}

fn read_u16(buf: &[u8], at: usize) -> RedirectResult<u16> {
    buf.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| invalid(format!("truncated at byte {}", at)))
}

fn read_u32(buf: &[u8], at: usize) -> RedirectResult<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| invalid(format!("truncated at byte {}", at)))
}

fn invalid(message: String) -> RedirectError {
    RedirectError::InvalidReparseData(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symlink_buffer(target: &str, relative: bool) -> Vec<u8> {
        let name: Vec<u16> = target.encode_utf16().collect();
        let bytes = (name.len() * 2) as u16;
        let mut buf = Vec::new();
        buf.extend_from_slice(&IO_REPARSE_TAG_SYMLINK.to_le_bytes());
        buf.extend_from_slice(&(SYMLINK_FIELDS_LEN as u16 + bytes * 2).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&bytes.to_le_bytes());
        buf.extend_from_slice(&bytes.to_le_bytes());
        buf.extend_from_slice(&bytes.to_le_bytes());
        buf.extend_from_slice(&(relative as u32).to_le_bytes());
        for _ in 0..2 {
            for unit in &name {
                buf.extend_from_slice(&unit.to_le_bytes());
            }
        }
        buf
    }

    #[test]
    fn mount_point_buffer_decodes_to_target() {
        let buf = encode_mount_point(r"D:\Apps\App").unwrap();
        let data = decode(&buf).unwrap();
        assert_eq!(data.kind(), Some(RedirectKind::Junction));
        assert_eq!(data.substitute_name, r"\??\D:\Apps\App");
        assert_eq!(data.print_name, r"D:\Apps\App");
        assert_eq!(data.target(), PathBuf::from(r"D:\Apps\App"));
    }

    #[test]
    fn verbatim_and_unc_targets_are_normalized() {
        assert_eq!(substitute_name(r"\\?\D:\Apps"), r"\??\D:\Apps");
        assert_eq!(substitute_name(r"\\server\share\app"), r"\??\UNC\server\share\app");

        let buf = encode_mount_point(r"\\?\UNC\server\share\app").unwrap();
        let data = decode(&buf).unwrap();
        assert_eq!(data.target(), PathBuf::from(r"\\server\share\app"));
    }

    #[test]
    fn symlink_relative_flag_is_honored() {
        let data = decode(&symlink_buffer(r"..\shared", true)).unwrap();
        assert_eq!(data.kind(), Some(RedirectKind::SymbolicLink));
        assert!(data.relative);
        assert_eq!(data.target(), PathBuf::from(r"..\shared"));

        let data = decode(&symlink_buffer(r"\??\E:\Games", false)).unwrap();
        assert!(!data.relative);
        assert_eq!(data.target(), PathBuf::from(r"E:\Games"));
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        let buf = encode_mount_point(r"D:\Apps\App").unwrap();
        assert!(decode(&buf[..4]).is_err());
        assert!(decode(&buf[..buf.len() - 6]).is_err());
    }

    #[test]
    fn out_of_bounds_name_offset_is_rejected() {
        let mut buf = encode_mount_point(r"D:\Apps\App").unwrap();
        // SubstituteNameOffset -> far past the path buffer
        buf[8..10].copy_from_slice(&0x4000u16.to_le_bytes());
        assert!(matches!(
            decode(&buf),
            Err(RedirectError::InvalidReparseData(_))
        ));

        let mut buf = encode_mount_point(r"D:\Apps\App").unwrap();
        // odd length splits a UTF-16 unit
        buf[10..12].copy_from_slice(&3u16.to_le_bytes());
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn foreign_tags_are_not_redirects() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x8000_0013u32.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        let data = decode(&buf).unwrap();
        assert_eq!(data.kind(), None);
    }

    #[test]
    fn oversized_target_is_refused() {
        let long = format!(r"D:\{}", "a".repeat(MAXIMUM_REPARSE_DATA_BUFFER_SIZE));
        assert!(matches!(
            encode_mount_point(&long),
            Err(RedirectError::InvalidArgument(_))
        ));
    }

    #[test]
    fn delete_header_carries_tag_only() {
        let header = delete_header(IO_REPARSE_TAG_MOUNT_POINT);
        assert_eq!(&header[..4], &IO_REPARSE_TAG_MOUNT_POINT.to_le_bytes());
        assert_eq!(&header[4..], &[0, 0, 0, 0]);
    }
}
