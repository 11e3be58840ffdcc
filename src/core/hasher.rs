//! Incremental digest computation.
//!
//! A [`Hasher`] accumulates arbitrarily-sized chunks and produces a lowercase
//! hex digest. `finalize` consumes the hasher, so it cannot be fed again.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

/// Buffer size for streaming files through a hasher (128KB)
const CHUNK_SIZE: usize = 128 * 1024;

/// Digest algorithms used by catalog entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Length of the hex-encoded digest.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
        })
    }
}

/// Incremental message digest.
pub trait Hasher: Send {
    /// Feed the next chunk of the message.
    fn update(&mut self, bytes: &[u8]);

    /// Lowercase hexadecimal digest of everything fed so far.
    fn finalize(self: Box<Self>) -> String;
}

struct DigestHasher<D>(D);

impl<D> Hasher for DigestHasher<D>
where
    D: Digest + Send,
{
    fn update(&mut self, bytes: &[u8]) {
        Digest::update(&mut self.0, bytes);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

/// A fresh hasher for the given algorithm.
pub fn hasher_for(algorithm: HashAlgorithm) -> Box<dyn Hasher> {
    match algorithm {
        HashAlgorithm::Sha256 => Box::new(DigestHasher(Sha256::new())),
        HashAlgorithm::Sha512 => Box::new(DigestHasher(Sha512::new())),
    }
}

/// Digest of a whole file, streamed in fixed-size chunks.
///
/// Failing to open or read the file is an I/O error, never a mismatch.
pub fn checksum(path: &Path, algorithm: HashAlgorithm) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = hasher_for(algorithm);
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// [`checksum`] on a blocking thread, for callers on the async runtime.
pub async fn checksum_async(path: PathBuf, algorithm: HashAlgorithm) -> io::Result<String> {
    tokio::task::spawn_blocking(move || checksum(&path, algorithm))
        .await
        .map_err(io::Error::other)?
}
