//! Differential assertions between the OS view of a file and the tester's.
//!
//! Length is checked before content. On a mismatch the failure carries both
//! observations: sizes, the first differing offset, short previews and
//! SHA-256 digests, instead of dumping potentially large payloads.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::driver::ReadReport;
use crate::error::HarnessError;

/// Bytes shown on each side of a content mismatch.
const PREVIEW_LEN: usize = 32;

/// The two I/O paths disagreed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssertionFailure {
    #[error("{context}: length mismatch - tester reported {reported} bytes, expected {expected} bytes")]
    LengthMismatch {
        context: String,
        reported: i64,
        expected: usize,
    },

    #[error("{context}: content mismatch at byte {}\n{}", .detail.offset, .detail)]
    ContentMismatch {
        context: String,
        detail: Box<Mismatch>,
    },
}

/// Both sides of a content mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// First offset at which the two sides differ (or where one ends).
    pub offset: usize,
    pub expected_len: usize,
    pub actual_len: usize,
    pub expected_preview: String,
    pub actual_preview: String,
    pub expected_sha256: String,
    pub actual_sha256: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  expected: {} bytes, sha256 {}, from offset {}: {}",
            self.expected_len, self.expected_sha256, self.offset, self.expected_preview
        )?;
        write!(
            f,
            "  actual:   {} bytes, sha256 {}, from offset {}: {}",
            self.actual_len, self.actual_sha256, self.offset, self.actual_preview
        )
    }
}

/// SHA-256 of `data`, hex encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare two byte slices, reporting where they first diverge.
pub fn compare_bytes(actual: &[u8], expected: &[u8], context: &str) -> Result<(), AssertionFailure> {
    if actual == expected {
        return Ok(());
    }
    let offset = actual
        .iter()
        .zip(expected)
        .position(|(a, e)| a != e)
        .unwrap_or_else(|| actual.len().min(expected.len()));
    Err(AssertionFailure::ContentMismatch {
        context: context.to_string(),
        detail: Box::new(Mismatch {
            offset,
            expected_len: expected.len(),
            actual_len: actual.len(),
            expected_preview: preview(expected, offset),
            actual_preview: preview(actual, offset),
            expected_sha256: sha256_hex(expected),
            actual_sha256: sha256_hex(actual),
        }),
    })
}

/// Check a reported length against the length observed independently.
pub fn compare_length(reported: i64, expected: usize, context: &str) -> Result<(), AssertionFailure> {
    if usize::try_from(reported).is_ok_and(|reported| reported == expected) {
        Ok(())
    } else {
        Err(AssertionFailure::LengthMismatch {
            context: context.to_string(),
            reported,
            expected,
        })
    }
}

/// Tester read must match the OS read in length and content.
pub fn assert_read_agrees(report: &ReadReport, expected: &[u8], context: &str) -> Result<(), AssertionFailure> {
    compare_length(report.reported_len, expected.len(), context)?;
    compare_bytes(&report.data, expected, context)
}

/// Tester write must report the full payload and the OS must read it back.
pub fn assert_write_agrees(
    reported_len: i64,
    payload: &str,
    observed: &[u8],
    context: &str,
) -> Result<(), AssertionFailure> {
    compare_length(reported_len, payload.len(), context)?;
    compare_bytes(observed, payload.as_bytes(), context)
}

/// Read up to `count` bytes from the start of `path` (the whole file if `None`).
///
/// A count past the end of the file yields the available bytes.
pub fn os_read(path: &Path, count: Option<u64>) -> Result<Vec<u8>, HarnessError> {
    let mut file = File::open(path)
        .map_err(|e| HarnessError::io(format!("open {}", path.display()), e))?;
    let mut data = Vec::new();
    let read = match count {
        Some(count) => file.by_ref().take(count).read_to_end(&mut data),
        None => file.read_to_end(&mut data),
    };
    read.map_err(|e| HarnessError::io(format!("read {}", path.display()), e))?;
    Ok(data)
}

/// Size of `path` as reported by the OS.
pub fn os_size(path: &Path) -> Result<u64, HarnessError> {
    std::fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|e| HarnessError::io(format!("stat {}", path.display()), e))
}

/// Truncate `path` back to empty so the fixture can be reused.
pub fn truncate_to_empty(path: &Path) -> Result<(), HarnessError> {
    OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map(drop)
        .map_err(|e| HarnessError::io(format!("truncate {}", path.display()), e))
}

fn preview(data: &[u8], offset: usize) -> String {
    let start = offset.min(data.len());
    let end = (start + PREVIEW_LEN).min(data.len());
    let shown = String::from_utf8_lossy(&data[start..end]);
    if end < data.len() {
        format!("{shown:?}...")
    } else {
        format!("{shown:?}")
    }
}
