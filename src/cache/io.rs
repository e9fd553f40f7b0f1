//! Disk I/O Helpers
//!
//! Positioned read/write loops for the disk tier. Partial transfers are
//! accumulated and `Interrupted` is retried; everything else ends the loop
//! and the caller compares the returned count with what it asked for.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Fallback when the platform page size is unavailable.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// How a store opens a caller-named backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    /// Existing file, read only
    Read,
    /// New file, write only
    Write,
    /// Existing or new file, read and write
    ReadWrite,
}

/// Platform page size in bytes.
#[cfg(unix)]
pub fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        DEFAULT_PAGE_SIZE
    }
}

#[cfg(not(unix))]
pub fn page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

/// Round `length` up to the next multiple of the page size.
pub fn page_align(length: u64) -> u64 {
    let page = page_size();
    length.div_ceil(page).saturating_mul(page)
}

#[cfg(unix)]
fn read_at_once(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at_once(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at_once(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at_once(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

/// Read into `buf` starting at `offset`, returning the number of bytes read.
///
/// Stops early at end of file or on the first non-`Interrupted` error.
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> usize {
    let mut done = 0usize;
    while done < buf.len() {
        match read_at_once(file, &mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("positioned read at {} failed: {}", offset + done as u64, e);
                break;
            }
        }
    }
    done
}

/// Write `buf` starting at `offset`, returning the number of bytes written.
pub fn write_at(file: &File, buf: &[u8], offset: u64) -> usize {
    let mut done = 0usize;
    while done < buf.len() {
        match write_at_once(file, &buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("positioned write at {} failed: {}", offset + done as u64, e);
                break;
            }
        }
    }
    done
}

/// Make sure the file is at least `length` bytes long.
///
/// A shorter file is grown by writing one zero byte at `length - 1`, which
/// leaves a sparse hole on filesystems that support one.
pub fn extend(file: &File, length: u64) -> io::Result<()> {
    if length == 0 {
        return Ok(());
    }
    let current = file.metadata()?.len();
    if current >= length {
        return Ok(());
    }
    if write_at(file, &[0u8], length - 1) != 1 {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "unable to write final byte",
        ));
    }
    Ok(())
}

/// Open a caller-named backing file in the given mode.
///
/// Write mode first tries to create the file exclusively and falls back to
/// opening an existing one without truncation.
pub fn open_backing_file(path: &Path, mode: MapMode) -> io::Result<File> {
    match mode {
        MapMode::Read => OpenOptions::new().read(true).open(path),
        MapMode::Write => OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .or_else(|_| OpenOptions::new().write(true).open(path)),
        MapMode::ReadWrite => OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn test_page_align() {
        let page = page_size();
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
    }

    #[test]
    fn test_write_then_read_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let file = open_backing_file(&path, MapMode::ReadWrite).unwrap();

        assert_eq!(write_at(&file, b"pixel", 100), 5);
        let mut buf = [0u8; 5];
        assert_eq!(read_at(&file, &mut buf, 100), 5);
        assert_eq!(&buf, b"pixel");
    }

    #[test]
    fn test_short_read_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let file = open_backing_file(&path, MapMode::ReadWrite).unwrap();
        write_at(&file, &[1, 2, 3], 0);

        let mut buf = [0u8; 8];
        assert_eq!(read_at(&file, &mut buf, 0), 3);
    }

    #[test]
    fn test_extend_grows_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extend.bin");
        let file = open_backing_file(&path, MapMode::ReadWrite).unwrap();

        extend(&file, 4096).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 4096);
        extend(&file, 10).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 4096);

        let mut buf = [0xffu8; 16];
        assert_eq!(read_at(&file, &mut buf, 4080), 16);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_read_mode_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        assert!(open_backing_file(&path, MapMode::Read).is_err());
    }

    #[test]
    fn test_write_mode_reopens_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.bin");
        std::fs::write(&path, b"abc").unwrap();
        let file = open_backing_file(&path, MapMode::Write).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 3);
    }
}
