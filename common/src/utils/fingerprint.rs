use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Identity of one file version: content hash plus OS metadata at call
/// time. Recomputed on every indexing pass and stamped onto the records
/// produced from that version; never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Computes the fingerprint for `path`. Reads the file in 8KB blocks so
/// memory use stays constant regardless of file size.
pub fn fingerprint(path: &Path) -> Result<FileFingerprint, std::io::Error> {
    let metadata = std::fs::metadata(path)?;
    let modified_at: DateTime<Utc> = metadata.modified()?.into();

    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(buffer.get(..n).unwrap_or(&buffer));
    }

    Ok(FileFingerprint {
        path: path.to_string_lossy().into_owned(),
        content_hash: format!("{:x}", hasher.finalize()),
        size_bytes: metadata.len(),
        modified_at,
    })
}
