//! SHA-256 content digests.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest as _, Sha256};

use crate::error::{io_err, ArtifactError};
use crate::types::Digest;

const READ_CHUNK: usize = 64 * 1024;

/// Digest of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest(hex::encode(hasher.finalize()))
}

/// Stream a file through SHA-256, returning its digest and size in bytes.
pub fn digest_file(path: &Path) -> Result<(Digest, u64), ArtifactError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut reader = BufReader::with_capacity(READ_CHUNK, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((Digest(hex::encode(hasher.finalize())), size))
}
