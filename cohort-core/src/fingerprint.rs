//! Content fingerprints recorded on exclusive grants.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{io_err, CoreError};

/// Hex SHA-256 of the file at `path`.
///
/// `Ok(None)` when the file does not exist, is not a regular file, or is
/// larger than `max_bytes`.
pub fn fingerprint_file(path: &Path, max_bytes: u64) -> Result<Option<String>, CoreError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    if !meta.is_file() || meta.len() > max_bytes {
        return Ok(None);
    }

    let mut file = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(hex::encode(hasher.finalize())))
}
