//! Compression method dispatch.
//!
//! A bundle's payload is compressed as a single unit with one of the
//! methods below; the method name travels in the bundle header and the
//! repository's default lives in `info_extended`. Names are frozen:
//! a reader that does not recognise a name must fail, never fall back.
//!
//! The format version rule exists for compatibility with early tools
//! that hardcoded LZMA: a bundle compressed with `lzma` is version 1,
//! anything else is version 2, and readers reject version 3 and above.

use std::io::Cursor;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("unsupported compression method '{0}'")]
    UnsupportedMethod(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Bundle format version written for LZMA payloads.
pub const FILE_FORMAT_VERSION: u32 = 1;
/// Bundle format version written for any non-LZMA payload.
pub const FILE_FORMAT_VERSION_NOT_LZMA: u32 = 2;
/// First version this build refuses to read.
pub const FILE_FORMAT_VERSION_FIRST_UNSUPPORTED: u32 = 3;

const ZSTD_LEVEL: i32 = 3;

/// The compression methods a bundle payload can be encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Highest ratio, slowest. The historical default.
    Lzma,
    /// Block codec, maximum throughput. Fills the slot the original
    /// block codec (LZO) occupied; `lzo` is accepted as a CLI alias.
    Lz4,
    /// Balanced speed/ratio.
    Zstd,
}

impl CompressionMethod {
    /// The frozen on-disk method name.
    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::Lzma => "lzma",
            CompressionMethod::Lz4 => "lz4",
            CompressionMethod::Zstd => "zstd",
        }
    }

    /// Resolve an on-disk method name. Unknown names fail hard.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "lzma" => Ok(CompressionMethod::Lzma),
            "lz4" => Ok(CompressionMethod::Lz4),
            "zstd" => Ok(CompressionMethod::Zstd),
            _ => Err(Error::UnsupportedMethod(name.to_owned())),
        }
    }

    /// Parse a CLI token. `lzo` selects the block codec slot, which this
    /// build fills with LZ4.
    pub fn from_cli_token(token: &str) -> Result<Self> {
        match token {
            "lzo" => Ok(CompressionMethod::Lz4),
            other => Self::from_name(other),
        }
    }

    /// The bundle format version a payload in this method carries.
    pub fn bundle_version(self) -> u32 {
        if self == CompressionMethod::Lzma {
            FILE_FORMAT_VERSION
        } else {
            FILE_FORMAT_VERSION_NOT_LZMA
        }
    }

    /// One-shot compression of a whole payload.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::Lzma => {
                let mut out = Vec::new();
                lzma_rs::lzma_compress(&mut Cursor::new(data), &mut out)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                Ok(out)
            }
            // One-shot buffer codec: the uncompressed size is prepended
            // so the decoder can allocate exactly.
            CompressionMethod::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionMethod::Zstd => zstd::stream::encode_all(data, ZSTD_LEVEL)
                .map_err(|e| Error::Compression(e.to_string())),
        }
    }

    /// The reverse of [`compress`](Self::compress).
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::Lzma => {
                let mut out = Vec::new();
                lzma_rs::lzma_decompress(&mut Cursor::new(data), &mut out)
                    .map_err(|e| Error::Decompression(e.to_string()))?;
                Ok(out)
            }
            CompressionMethod::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::Decompression(e.to_string())),
            CompressionMethod::Zstd => {
                zstd::stream::decode_all(data).map_err(|e| Error::Decompression(e.to_string()))
            }
        }
    }
}

impl Default for CompressionMethod {
    fn default() -> Self {
        CompressionMethod::Lzma
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHODS: [CompressionMethod; 3] =
        [CompressionMethod::Lzma, CompressionMethod::Lz4, CompressionMethod::Zstd];

    #[test]
    fn round_trip_every_method() {
        let data: Vec<u8> = (0..50_000u32).map(|x| (x % 251) as u8).collect();
        for method in METHODS {
            let packed = method.compress(&data).unwrap();
            assert_eq!(method.decompress(&packed).unwrap(), data, "{}", method.name());
        }
    }

    #[test]
    fn empty_payload_round_trips() {
        for method in METHODS {
            let packed = method.compress(&[]).unwrap();
            assert!(method.decompress(&packed).unwrap().is_empty());
        }
    }

    #[test]
    fn version_rule() {
        assert_eq!(CompressionMethod::Lzma.bundle_version(), 1);
        assert_eq!(CompressionMethod::Lz4.bundle_version(), 2);
        assert_eq!(CompressionMethod::Zstd.bundle_version(), 2);
    }

    #[test]
    fn name_round_trip_and_lzo_alias() {
        for method in METHODS {
            assert_eq!(CompressionMethod::from_name(method.name()).unwrap(), method);
        }
        assert_eq!(
            CompressionMethod::from_cli_token("lzo").unwrap(),
            CompressionMethod::Lz4
        );
        assert!(CompressionMethod::from_name("lzo").is_err());
        assert!(CompressionMethod::from_name("snappy").is_err());
    }
}
