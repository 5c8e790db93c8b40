//! Shared-memory fast path for homogeneous numeric arrays.
//!
//! When both peers sit on the same host, large arrays skip the stream codec
//! and travel through a file in a shared region (conventionally the OS
//! shared-memory mount). The file is self-describing:
//! `[7-byte magic "SHMARRY"][1-byte element-kind][element bytes]`.
//! Each file has exactly one reader, and the reader owns cleanup: it unlinks
//! the file once the contents are copied out. A writer that fails part-way
//! unlinks its own file and reports the failure; it never leaves a stale or
//! truncated buffer for the peer to pick up.

use std::{
    fs,
    io::{ErrorKind as IoErrorKind, Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use thiserror::Error;

use crate::codec::ElementKind;

/// File magic; seven bytes so the element kind lands at offset 7.
pub const MAGIC: &[u8; 7] = b"SHMARRY";

/// Header length: magic plus the element-kind byte.
pub const HEADER_LEN: usize = MAGIC.len() + 1;

/// Errors raised by the shared-memory channel.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Another writer owns the generated filename.
    #[error("shared-memory filename collision: {0}")]
    Collision(PathBuf),
    /// The region has no room for the array.
    #[error("shared-memory region out of space")]
    OutOfSpace,
    /// File is shorter than the header or the magic does not match.
    #[error("corrupt shared-memory header")]
    CorruptHeader,
    /// Header element kind differs from the expected kind.
    #[error("element-kind mismatch: file has {found:?}, expected {expected:?}")]
    KindMismatch {
        /// Kind recorded in the file header.
        found: ElementKind,
        /// Kind announced on the wire.
        expected: ElementKind,
    },
    /// File length does not match the announced element count.
    #[error("partial shared-memory write: {actual} bytes, expected {expected}")]
    PartialWrite {
        /// Bytes present on disk.
        actual: u64,
        /// Bytes the header and length imply.
        expected: u64,
    },
    /// Any other filesystem failure.
    #[error("shared-memory I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShmError {
    /// Map onto the wire-visible error kind.
    #[must_use]
    pub const fn wire_kind(&self) -> crate::error::ErrorKind {
        match self {
            Self::OutOfSpace => crate::error::ErrorKind::ShmOutOfSpace,
            _ => crate::error::ErrorKind::ShmIoFailed,
        }
    }
}

/// The conventional shared region for this platform.
#[must_use]
pub fn default_region() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() { shm } else { std::env::temp_dir() }
}

fn unique_name(kind: ElementKind) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let tid = format!("{:?}", std::thread::current().id());
    let tid: String = tid.chars().filter(char::is_ascii_digit).collect();
    let salt: u32 = rand::thread_rng().r#gen();
    format!("janus-{nanos:x}-{tid}-{salt:08x}-k{}", kind.code())
}

/// Write an array into the region and return the file path for the wire.
///
/// The element bytes are already packed (big-endian, `kind.width()` bytes
/// per element). On any failure after creation the file is unlinked before
/// the error is returned.
///
/// # Errors
/// Returns [`ShmError::Collision`] when the generated name already exists,
/// [`ShmError::OutOfSpace`] when the region is full, and
/// [`ShmError::PartialWrite`] when the post-write size check fails.
pub fn write_array(region: &Path, kind: ElementKind, data: &[u8]) -> Result<PathBuf, ShmError> {
    let path = region.join(unique_name(kind));
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(f) => f,
        Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
            return Err(ShmError::Collision(path));
        }
        Err(e) => return Err(e.into()),
    };
    let result = write_body(&mut file, &path, kind, data);
    if result.is_err() {
        drop(file);
        let _ = fs::remove_file(&path);
    }
    result.map(|()| path)
}

fn write_body(
    file: &mut fs::File,
    path: &Path,
    kind: ElementKind,
    data: &[u8],
) -> Result<(), ShmError> {
    let write_all = |file: &mut fs::File, bytes: &[u8]| -> Result<(), ShmError> {
        file.write_all(bytes).map_err(|e| {
            if e.kind() == IoErrorKind::StorageFull {
                ShmError::OutOfSpace
            } else {
                ShmError::Io(e)
            }
        })
    };
    write_all(file, MAGIC)?;
    write_all(file, &[kind.code()])?;
    write_all(file, data)?;
    file.sync_data()?;
    let expected = (HEADER_LEN + data.len()) as u64;
    let actual = fs::metadata(path)?.len();
    if actual != expected {
        return Err(ShmError::PartialWrite { actual, expected });
    }
    Ok(())
}

/// Read an array back and unlink the file.
///
/// The file is removed whether or not validation succeeds; a corrupt file
/// left behind would otherwise leak until reboot.
///
/// # Errors
/// Returns [`ShmError::CorruptHeader`] for a short file or bad magic,
/// [`ShmError::KindMismatch`] when the header kind differs from
/// `expected_kind`, and [`ShmError::PartialWrite`] when the byte count
/// does not match `expected_len` elements.
pub fn read_array(
    path: &Path,
    expected_kind: ElementKind,
    expected_len: u64,
) -> Result<Vec<u8>, ShmError> {
    let result = read_body(path, expected_kind, expected_len);
    let _ = fs::remove_file(path);
    result
}

fn read_body(
    path: &Path,
    expected_kind: ElementKind,
    expected_len: u64,
) -> Result<Vec<u8>, ShmError> {
    let mut file = fs::File::open(path)?;
    let mut header = [0u8; HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|_| ShmError::CorruptHeader)?;
    if &header[..MAGIC.len()] != MAGIC {
        return Err(ShmError::CorruptHeader);
    }
    let found = ElementKind::from_code(header[MAGIC.len()]).ok_or(ShmError::CorruptHeader)?;
    if found != expected_kind {
        return Err(ShmError::KindMismatch {
            found,
            expected: expected_kind,
        });
    }
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let expected_bytes = expected_len.saturating_mul(expected_kind.width() as u64);
    if data.len() as u64 != expected_bytes {
        return Err(ShmError::PartialWrite {
            actual: data.len() as u64,
            expected: expected_bytes,
        });
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn pack_f64(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[rstest]
    fn round_trip_unlinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<f64> = (0..10).map(f64::from).collect();
        let data = pack_f64(&values);
        let path = write_array(dir.path(), ElementKind::F64, &data).unwrap();
        assert!(path.exists());
        let read = read_array(&path, ElementKind::F64, 10).unwrap();
        assert_eq!(read, data);
        assert!(!path.exists(), "reader must unlink the file");
    }

    #[rstest]
    fn bad_magic_is_corrupt_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");
        fs::write(&path, b"NOTSHMX\x06abc").unwrap();
        assert!(matches!(
            read_array(&path, ElementKind::F64, 1),
            Err(ShmError::CorruptHeader)
        ));
        assert!(!path.exists(), "corrupt files are still unlinked");
    }

    #[rstest]
    fn kind_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let data = pack_f64(&[1.0]);
        let path = write_array(dir.path(), ElementKind::F64, &data).unwrap();
        assert!(matches!(
            read_array(&path, ElementKind::I32, 2),
            Err(ShmError::KindMismatch { .. })
        ));
    }

    #[rstest]
    fn short_body_is_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        let mut bytes = MAGIC.to_vec();
        bytes.push(ElementKind::I64.code());
        bytes.extend_from_slice(&[0u8; 4]); // half an element
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_array(&path, ElementKind::I64, 1),
            Err(ShmError::PartialWrite { .. })
        ));
    }

    #[rstest]
    fn distinct_names_for_concurrent_writes() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_array(dir.path(), ElementKind::I8, &[1]).unwrap();
        let b = write_array(dir.path(), ElementKind::I8, &[2]).unwrap();
        assert_ne!(a, b);
    }
}
