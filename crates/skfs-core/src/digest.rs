//! Content digests of data streams
//!
//! Hashes are computed over the bytes a [`FileHandle`] reads, so a digest
//! taken from the image matches one taken from an exported copy.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SkError};
use crate::file::{FileHandle, Whence};
use crate::ident::StreamIdentifier;

const CHUNK_SIZE: u64 = 64 * 1024;

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    MD5,
    SHA1,
    SHA256,
    SHA512,
}

impl HashAlgorithm {
    pub fn all() -> Vec<Self> {
        vec![Self::MD5, Self::SHA1, Self::SHA256, Self::SHA512]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MD5 => "MD5",
            Self::SHA1 => "SHA1",
            Self::SHA256 => "SHA256",
            Self::SHA512 => "SHA512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = SkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::MD5),
            "sha1" => Ok(Self::SHA1),
            "sha256" => Ok(Self::SHA256),
            "sha512" => Ok(Self::SHA512),
            other => Err(SkError::Parse(format!("unknown hash algorithm {:?}", other))),
        }
    }
}

/// Digest of one data stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamHash {
    pub id: StreamIdentifier,
    pub algorithm: HashAlgorithm,
    /// Lowercase hexadecimal digest
    pub hash: String,
    /// Bytes hashed
    pub size: u64,
}

/// Hash the whole stream, leaving the cursor at its end
pub fn hash_stream(file: &mut FileHandle<'_>, algorithm: HashAlgorithm) -> Result<StreamHash> {
    file.seek(0, Whence::Start)?;

    let mut size = 0u64;
    let hash = match algorithm {
        HashAlgorithm::MD5 => {
            let mut context = md5::Context::new();
            feed(file, &mut size, |chunk| context.consume(chunk))?;
            format!("{:x}", context.compute())
        }
        HashAlgorithm::SHA1 => digest_stream::<sha1::Sha1>(file, &mut size)?,
        HashAlgorithm::SHA256 => digest_stream::<Sha256>(file, &mut size)?,
        HashAlgorithm::SHA512 => digest_stream::<Sha512>(file, &mut size)?,
    };

    tracing::debug!("{} of {}: {}", algorithm, file.id(), hash);
    Ok(StreamHash {
        id: file.id(),
        algorithm,
        hash,
        size,
    })
}

fn digest_stream<D: Digest>(file: &mut FileHandle<'_>, size: &mut u64) -> Result<String> {
    let mut hasher = D::new();
    feed(file, size, |chunk| hasher.update(chunk))?;
    Ok(hex(&hasher.finalize()))
}

fn feed(file: &mut FileHandle<'_>, size: &mut u64, mut sink: impl FnMut(&[u8])) -> Result<()> {
    loop {
        let chunk = file.read(Some(CHUNK_SIZE))?;
        if chunk.is_empty() {
            return Ok(());
        }
        *size += chunk.len() as u64;
        sink(&chunk);
    }
}

/// Hash a byte slice directly
pub fn calculate_hash(data: &[u8], algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::MD5 => format!("{:x}", md5::compute(data)),
        HashAlgorithm::SHA1 => hex(&sha1::Sha1::digest(data)),
        HashAlgorithm::SHA256 => hex(&Sha256::digest(data)),
        HashAlgorithm::SHA512 => hex(&Sha512::digest(data)),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
