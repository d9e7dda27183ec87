//! Value compressors, identified by the one-byte id stamped into the file
//! header. Pure `bytes -> bytes` transforms.

use std::io::Read;

use crate::error::{Error, Result};

/// Compressor applied to values before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Deflate,
    Brotli,
    Lz4,
    Zstd,
    Snappy,
    Lzma,
}

impl Compression {
    /// Resolves a header id to a compressor.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Deflate),
            3 => Ok(Compression::Brotli),
            4 => Ok(Compression::Lz4),
            5 => Ok(Compression::Zstd),
            6 => Ok(Compression::Snappy),
            7 => Ok(Compression::Lzma),
            _ => Err(Error::CorruptHeader(format!("unknown compression id {id}"))),
        }
    }

    /// The id written into the file header.
    pub fn id(&self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Deflate => 2,
            Compression::Brotli => 3,
            Compression::Lz4 => 4,
            Compression::Zstd => 5,
            Compression::Snappy => 6,
            Compression::Lzma => 7,
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut out = Vec::new();
                flate2::read::GzEncoder::new(data, flate2::Compression::default())
                    .read_to_end(&mut out)?;
                Ok(out)
            }
            Compression::Deflate => {
                let mut out = Vec::new();
                flate2::read::DeflateEncoder::new(data, flate2::Compression::default())
                    .read_to_end(&mut out)?;
                Ok(out)
            }
            Compression::Brotli => {
                let mut out = Vec::new();
                let params = brotli::enc::BrotliEncoderParams::default();
                brotli::BrotliCompress(&mut &data[..], &mut out, &params)?;
                Ok(out)
            }
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compression::Zstd => Ok(zstd::stream::encode_all(data, 0)?),
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| Error::IO(format!("snappy compression failed: {e}"))),
            Compression::Lzma => {
                let mut out = Vec::new();
                xz2::read::XzEncoder::new(data, 6).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    /// Reverses [`Compression::compress`]. Failures are reported as
    /// [`Error::CorruptEntry`] since they mean the stored bytes are not what
    /// this compressor produced.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut out = Vec::new();
                flate2::read::GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::CorruptEntry(format!("gzip: {e}")))?;
                Ok(out)
            }
            Compression::Deflate => {
                let mut out = Vec::new();
                flate2::read::DeflateDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::CorruptEntry(format!("deflate: {e}")))?;
                Ok(out)
            }
            Compression::Brotli => {
                let mut out = Vec::new();
                brotli::BrotliDecompress(&mut &data[..], &mut out)
                    .map_err(|e| Error::CorruptEntry(format!("brotli: {e}")))?;
                Ok(out)
            }
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::CorruptEntry(format!("lz4: {e}"))),
            Compression::Zstd => zstd::stream::decode_all(data)
                .map_err(|e| Error::CorruptEntry(format!("zstd: {e}"))),
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| Error::CorruptEntry(format!("snappy: {e}"))),
            Compression::Lzma => {
                let mut out = Vec::new();
                xz2::read::XzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::CorruptEntry(format!("lzma: {e}")))?;
                Ok(out)
            }
        }
    }
}
