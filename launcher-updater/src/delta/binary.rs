//! Binary diff and patch using fast_rsync.
//!
//! A delta is computed against the rolling-hash signature of the old bytes
//! and replays into the new bytes when applied to the same old bytes.

use fast_rsync::{apply_limited, diff, Signature, SignatureOptions};
use std::io;

/// Default block size for signature generation (16KB)
const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Smaller blocks for small files so that local edits stay local
const SMALL_FILE_BLOCK_SIZE: u32 = 1024;
const SMALL_FILE_THRESHOLD: usize = 256 * 1024;

fn block_size_for(len: usize) -> u32 {
    if len < SMALL_FILE_THRESHOLD {
        SMALL_FILE_BLOCK_SIZE
    } else {
        DEFAULT_BLOCK_SIZE
    }
}

/// Compute the delta that turns `old` into `new`.
///
/// # Example
/// ```
/// use launcher_updater::delta::binary::{apply_delta, compute_delta};
///
/// let old = b"Hello, World!";
/// let new = b"Hello, Rust!";
/// let delta = compute_delta(old, new).unwrap();
/// assert_eq!(apply_delta(old, &delta, 1024).unwrap(), new);
/// ```
pub fn compute_delta(old: &[u8], new: &[u8]) -> io::Result<Vec<u8>> {
    let options = SignatureOptions {
        block_size: block_size_for(old.len()),
        crypto_hash_size: 8, // Strong hash (8 bytes = 64 bits)
    };
    let signature = Signature::calculate(old, options);
    let mut delta = Vec::new();
    diff(&signature.index(), new, &mut delta)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(delta)
}

/// Apply `delta` to `base`, refusing to produce more than `limit` bytes.
pub fn apply_delta(base: &[u8], delta: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    apply_limited(base, delta, &mut output, limit)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(output)
}

/// Ratio of delta size to new file size; 0.0 for an empty new file.
pub fn delta_compression_ratio(delta_size: u64, new_file_size: u64) -> f64 {
    if new_file_size == 0 {
        return 0.0;
    }
    delta_size as f64 / new_file_size as f64
}
