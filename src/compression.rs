//! Stream compression for the embedded archive
//!
//! One encoder/decoder pair per [`CompressionMethod`]. Encoders are plain
//! `Write` adapters with an explicit `finish()` so trailers are flushed
//! before the archive file is closed and hashed.

use std::io::{self, Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::GzBuilder;
use thiserror::Error;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

pub use shellpack_protocol::CompressionMethod;

/// Lowest accepted compression level
pub const MIN_LEVEL: u32 = 1;

/// Highest accepted compression level
pub const MAX_LEVEL: u32 = 9;

/// Default compression level
pub const DEFAULT_LEVEL: u32 = 6;

/// Compression-related errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("failed to compress {method} data: {source}")]
    Compression {
        method: &'static str,
        source: io::Error,
    },

    #[error("failed to decompress {method} data: {source}")]
    Decompression {
        method: &'static str,
        source: io::Error,
    },

    #[error("compression level {0} out of range 1-9")]
    InvalidLevel(u32),
}

/// A compressing writer for any supported method
pub enum Encoder<W: Write> {
    Store(W),
    Gzip(GzEncoder<W>),
    Bzip2(BzEncoder<W>),
    Xz(XzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// Wrap `inner` with the encoder for `method`. The level is ignored for
    /// store. Gzip headers carry mtime 0 so output depends only on input.
    pub fn new(inner: W, method: CompressionMethod, level: u32) -> Result<Self, CompressionError> {
        if method.uses_level() && !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
            return Err(CompressionError::InvalidLevel(level));
        }
        Ok(match method {
            CompressionMethod::Store => Self::Store(inner),
            CompressionMethod::Gzip => Self::Gzip(
                GzBuilder::new()
                    .mtime(0)
                    .write(inner, flate2::Compression::new(level)),
            ),
            CompressionMethod::Bzip2 => {
                Self::Bzip2(BzEncoder::new(inner, bzip2::Compression::new(level)))
            }
            CompressionMethod::Xz => Self::Xz(XzEncoder::new(inner, level)),
        })
    }

    /// Flush trailers and return the inner writer
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::Store(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Self::Gzip(e) => e.finish(),
            Self::Bzip2(e) => e.finish(),
            Self::Xz(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Store(w) => w.write(buf),
            Self::Gzip(e) => e.write(buf),
            Self::Bzip2(e) => e.write(buf),
            Self::Xz(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Store(w) => w.flush(),
            Self::Gzip(e) => e.flush(),
            Self::Bzip2(e) => e.flush(),
            Self::Xz(e) => e.flush(),
        }
    }
}

/// Create a decompressing reader for the given method
pub fn create_decoder<'a, R: Read + 'a>(reader: R, method: CompressionMethod) -> Box<dyn Read + 'a> {
    match method {
        CompressionMethod::Store => Box::new(reader),
        CompressionMethod::Gzip => Box::new(GzDecoder::new(reader)),
        CompressionMethod::Bzip2 => Box::new(BzDecoder::new(reader)),
        CompressionMethod::Xz => Box::new(XzDecoder::new(reader)),
    }
}

/// Decompress a byte slice using the specified method
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::new();
    create_decoder(data, method)
        .read_to_end(&mut out)
        .map_err(|source| CompressionError::Decompression {
            method: method.name(),
            source,
        })?;
    Ok(out)
}

/// Compress a byte slice in memory
pub fn compress(data: &[u8], method: CompressionMethod, level: u32) -> Result<Vec<u8>, CompressionError> {
    let io_err = |source| CompressionError::Compression {
        method: method.name(),
        source,
    };
    let mut encoder = Encoder::new(Vec::new(), method, level)?;
    encoder.write_all(data).map_err(io_err)?;
    encoder.finish().map_err(io_err)
}

/// Identify the method from leading magic bytes.
///
/// Anything unrecognized is reported as store.
pub fn sniff(data: &[u8]) -> CompressionMethod {
    if data.starts_with(&[0x1f, 0x8b]) {
        CompressionMethod::Gzip
    } else if data.starts_with(b"BZh") {
        CompressionMethod::Bzip2
    } else if data.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        CompressionMethod::Xz
    } else {
        CompressionMethod::Store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"shellpack compression sample, repeated repeated repeated";

    #[test]
    fn test_every_method_roundtrips() {
        for method in CompressionMethod::PROBE_ORDER {
            let packed = compress(SAMPLE, method, 6).unwrap();
            assert_eq!(decompress(&packed, method).unwrap(), SAMPLE, "{}", method);
        }
    }

    #[test]
    fn test_sniff_matches_encoder_output() {
        for method in CompressionMethod::PROBE_ORDER {
            let packed = compress(SAMPLE, method, 9).unwrap();
            assert_eq!(sniff(&packed), method);
        }
    }

    #[test]
    fn test_gzip_output_is_deterministic() {
        let a = compress(SAMPLE, CompressionMethod::Gzip, 6).unwrap();
        let b = compress(SAMPLE, CompressionMethod::Gzip, 6).unwrap();
        assert_eq!(a, b);
        // mtime field in the gzip header
        assert_eq!(&a[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_invalid_level_rejected() {
        assert!(matches!(
            Encoder::new(Vec::new(), CompressionMethod::Xz, 0),
            Err(CompressionError::InvalidLevel(0))
        ));
        assert!(matches!(
            Encoder::new(Vec::new(), CompressionMethod::Gzip, 10),
            Err(CompressionError::InvalidLevel(10))
        ));
    }

    #[test]
    fn test_store_ignores_level() {
        let packed = compress(SAMPLE, CompressionMethod::Store, 0).unwrap();
        assert_eq!(packed, SAMPLE);
    }

    #[test]
    fn test_wrong_method_fails() {
        let packed = compress(SAMPLE, CompressionMethod::Gzip, 6).unwrap();
        assert!(decompress(&packed, CompressionMethod::Xz).is_err());
    }
}
