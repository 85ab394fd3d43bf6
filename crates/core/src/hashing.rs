use crate::error::IngestError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read size used while hashing, so memory stays flat for large files.
pub const DIGEST_BLOCK_SIZE: usize = 1024 * 1024;

/// SHA-256 hex digest of a file's bytes.
pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    if !path.exists() {
        return Err(IngestError::NotFound(path.to_path_buf()));
    }
    if path.is_dir() {
        return Err(IngestError::NotAFile(path.to_path_buf()));
    }

    let file = File::open(path)?;
    digest_reader(file)
}

pub fn digest_reader<R: Read>(mut reader: R) -> Result<String, IngestError> {
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; DIGEST_BLOCK_SIZE];

    loop {
        let read = reader.read(&mut block)?;
        if read == 0 {
            break;
        }
        hasher.update(&block[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
