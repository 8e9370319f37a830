use std::io;

use crate::error::{Error, Result};

/// Per-page compression choice. The `u8` codes are part of the on-disk
/// page header format and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn code(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Zstd => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            2 => Ok(Compression::Zstd),
            other => Err(Error::Decode(
                "compression code",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown compression code {}", other),
                ),
            )),
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compression::Zstd => {
                zstd::encode_all(data, 3).map_err(|e| Error::Encode("zstd page", e))
            }
        }
    }

    pub fn decompress(self, data: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let out = match self {
            Compression::None => data.to_vec(),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data).map_err(|e| {
                Error::Decode(
                    "lz4 page",
                    io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
                )
            })?,
            Compression::Zstd => {
                zstd::decode_all(data).map_err(|e| Error::Decode("zstd page", e))?
            }
        };
        if out.len() != raw_len {
            return Err(Error::Decode(
                "page payload",
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("inflated {} bytes, header claims {}", out.len(), raw_len),
                ),
            ));
        }
        Ok(out)
    }
}
