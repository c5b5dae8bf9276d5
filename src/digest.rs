//! Streaming content digests.
//!
//! Layer identity in containers-storage is the sha256 of the *uncompressed*
//! tar stream, together with the exact number of bytes in that stream.  The
//! helpers here compute both while bytes flow past, so that the producer of
//! an archive and the store ingesting it agree byte-for-byte.

use std::{
    fmt,
    io::{Error, ErrorKind, Read, Result, Write},
};

use sha2::{Digest, Sha256};

/// The digest and size of an uncompressed layer stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LayerDigest {
    /// `sha256:<hex>` over every byte of the stream.
    pub digest: String,
    /// Number of bytes in the stream, including padding and trailer.
    pub size: u64,
}

impl fmt::Display for LayerDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.digest, self.size)
    }
}

/// Formats a finished hasher as a canonical `sha256:<hex>` digest string.
fn canonical(hasher: Sha256) -> String {
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Computes the canonical digest of an in-memory blob.
pub fn sha256_digest(data: &[u8]) -> String {
    canonical(Sha256::new_with_prefix(data))
}

/// Checks that a string is a canonical `sha256:` digest with 64 hex digits.
///
/// In case of a failure this returns ErrorKind::InvalidInput.
pub fn validate_sha256(digest: &str) -> Result<()> {
    let Some(hexpart) = digest.strip_prefix("sha256:") else {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("digest {digest:?} is not sha256"),
        ));
    };
    let mut value = [0u8; 32];
    hex::decode_to_slice(hexpart, &mut value)
        .map_err(|source| Error::new(ErrorKind::InvalidInput, source))
}

/// A writer that hashes and counts everything written through it.
#[derive(Debug)]
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Returns the wrapped writer and the digest of everything written so far.
    pub fn finish(self) -> (W, LayerDigest) {
        let digest = LayerDigest {
            digest: canonical(self.hasher),
            size: self.count,
        };
        (self.inner, digest)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

/// A reader that hashes and counts everything read through it.
#[derive(Debug)]
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Reads the remainder of the stream, discarding it, and returns the
    /// digest of every byte that passed through.
    pub fn drain(mut self) -> Result<LayerDigest> {
        std::io::copy(&mut self, &mut std::io::sink())?;
        Ok(LayerDigest {
            digest: canonical(self.hasher),
            size: self.count,
        })
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}
