//! Branch pages: the unit of disk I/O.
//!
//! Layout:
//!
//! ```text
//! +--------+-------+---------+---------+---------+----------+------+
//! | crc32  | count | min_lsn | max_lsn | raw_len | data_len | comp |
//! |  u32   |  u32  |   u64   |   u64   |   u32   |   u32    |  u8  |
//! +--------+-------+---------+---------+---------+----------+------+
//! |                      payload (data_len bytes)                  |
//! +----------------------------------------------------------------+
//! ```
//!
//! The payload is the entry records back to back, optionally compressed
//! as a whole. The checksum covers everything after the crc field, so a
//! torn or bit-rotted page is always detected before any entry is
//! decoded. All integers are big-endian.

use std::io::Cursor;
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::statement::DiskEntry;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Header length in bytes, checksum included.
pub const PAGE_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4 + 4 + 1;

/// Per-entry record overhead: key_len, value_len, lsn, flags.
const ENTRY_OVERHEAD: usize = 4 + 4 + 8 + 1;

/// Summary of an encoded page, kept in the branch footer so lookups
/// can pick the right page without touching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMeta {
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub min_lsn: u64,
    pub max_lsn: u64,
    pub count: u32,
    pub raw_len: u32,
    pub stored_len: u32,
}

/// Accumulates sorted entries and encodes them as one page.
#[derive(Default)]
pub struct PageBuilder {
    entries: Vec<DiskEntry>,
    payload_size: usize,
}

impl PageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries must arrive in (key asc, lsn desc) order; the builder
    /// does not re-sort.
    pub fn add(&mut self, entry: DiskEntry) {
        self.payload_size += ENTRY_OVERHEAD + entry.key.len() + entry.value.len();
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Encode and drain the builder, leaving it ready for the next page.
    pub fn finish(&mut self, compression: Compression) -> Result<(Vec<u8>, PageMeta)> {
        debug_assert!(!self.entries.is_empty());
        let mut payload = Vec::with_capacity(self.payload_size);
        let mut min_lsn = u64::MAX;
        let mut max_lsn = 0u64;
        for entry in &self.entries {
            payload.write_u32::<BigEndian>(entry.key.len() as u32)?;
            payload.write_u32::<BigEndian>(entry.value.len() as u32)?;
            payload.write_u64::<BigEndian>(entry.lsn)?;
            payload.write_u8(entry.flags)?;
            payload.extend_from_slice(&entry.key);
            payload.extend_from_slice(&entry.value);
            min_lsn = min_lsn.min(entry.lsn);
            max_lsn = max_lsn.max(entry.lsn);
        }

        let raw_len = payload.len() as u32;
        let stored = compression.compress(&payload)?;

        let mut page = Vec::with_capacity(PAGE_HEADER_LEN + stored.len());
        page.write_u32::<BigEndian>(0)?; // checksum backfilled below
        page.write_u32::<BigEndian>(self.entries.len() as u32)?;
        page.write_u64::<BigEndian>(min_lsn)?;
        page.write_u64::<BigEndian>(max_lsn)?;
        page.write_u32::<BigEndian>(raw_len)?;
        page.write_u32::<BigEndian>(stored.len() as u32)?;
        page.write_u8(compression.code())?;
        page.extend_from_slice(&stored);
        let crc = CRC.checksum(&page[4..]);
        page[..4].copy_from_slice(&crc.to_be_bytes());

        let meta = PageMeta {
            min_key: self.entries.first().map(|e| e.key.clone()).unwrap_or_default(),
            max_key: self.entries.last().map(|e| e.key.clone()).unwrap_or_default(),
            min_lsn,
            max_lsn,
            count: self.entries.len() as u32,
            raw_len,
            stored_len: stored.len() as u32,
        };
        self.entries.clear();
        self.payload_size = 0;
        Ok((page, meta))
    }
}

/// A decoded page: its entries in (key asc, lsn desc) order.
#[derive(Debug)]
pub struct Page {
    pub entries: Vec<DiskEntry>,
    pub min_lsn: u64,
    pub max_lsn: u64,
}

impl Page {
    /// Verify the checksum and decode every entry. `path` and `offset`
    /// only feed error context.
    pub fn decode(bytes: &[u8], path: &Path, offset: u64) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_LEN {
            return Err(Error::Corruption {
                path: path.display().to_string(),
                detail: format!("page truncated to {} bytes", bytes.len()),
            });
        }
        let mut header = Cursor::new(bytes);
        let crc = header.read_u32::<BigEndian>()?;
        if crc != CRC.checksum(&bytes[4..]) {
            return Err(Error::ChecksumMismatch {
                path: path.display().to_string(),
                offset,
            });
        }
        let count = header.read_u32::<BigEndian>()?;
        let min_lsn = header.read_u64::<BigEndian>()?;
        let max_lsn = header.read_u64::<BigEndian>()?;
        let raw_len = header.read_u32::<BigEndian>()? as usize;
        let data_len = header.read_u32::<BigEndian>()? as usize;
        let compression = Compression::from_code(header.read_u8()?)?;

        if bytes.len() != PAGE_HEADER_LEN + data_len {
            return Err(Error::Corruption {
                path: path.display().to_string(),
                detail: format!(
                    "page length {} does not match header {}",
                    bytes.len(),
                    PAGE_HEADER_LEN + data_len
                ),
            });
        }
        let payload = compression.decompress(&bytes[PAGE_HEADER_LEN..], raw_len)?;

        let mut entries = Vec::with_capacity(count as usize);
        let mut cursor = Cursor::new(payload.as_slice());
        for _ in 0..count {
            let key_len = cursor.read_u32::<BigEndian>()? as usize;
            let value_len = cursor.read_u32::<BigEndian>()? as usize;
            let lsn = cursor.read_u64::<BigEndian>()?;
            let flags = cursor.read_u8()?;
            let at = cursor.position() as usize;
            let end = at + key_len + value_len;
            if end > payload.len() {
                return Err(Error::Corruption {
                    path: path.display().to_string(),
                    detail: "entry extends past page payload".to_string(),
                });
            }
            entries.push(DiskEntry {
                key: payload[at..at + key_len].to_vec(),
                value: payload[at + key_len..end].to_vec(),
                lsn,
                flags,
            });
            cursor.set_position(end as u64);
        }

        Ok(Self {
            entries,
            min_lsn,
            max_lsn,
        })
    }

    /// Newest entry for `key` with `lsn <= max_lsn`.
    pub fn find(&self, key: &[u8], max_lsn: u64) -> Option<&DiskEntry> {
        // First entry with this key is its newest version.
        let start = self.entries.partition_point(|e| e.key.as_slice() < key);
        self.entries[start..]
            .iter()
            .take_while(|e| e.key == key)
            .find(|e| e.lsn <= max_lsn)
    }
}
