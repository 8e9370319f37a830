//! Branch files: immutable sorted runs of pages with a footer index.
//!
//! ```text
//! +--------+--------+-- ... --+----------------+------------------+
//! | page 0 | page 1 |         |     footer     |     trailer      |
//! +--------+--------+-- ... --+----------------+------------------+
//! ```
//!
//! The footer carries per-page key ranges, LSN bounds and offsets, plus
//! the optional membership filter; point reads touch exactly one page.
//! The trailer is fixed-size so a reader finds the footer from the file
//! length alone. Writes go through the naming protocol in the parent
//! module: pages append to an `.incomplete` file, sealing renames it to
//! `.seal`, and committing renames it to its final `.index` name. Every
//! transition is a single atomic rename.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use tracing::debug;

use crate::compression::Compression;
use crate::disk::page::{Page, PageBuilder, PageMeta};
use crate::disk::{branch_path, incomplete_path, seal_path};
use crate::error::{Error, Result};
use crate::filter::{fingerprint, QuotientFilter};
use crate::statement::DiskEntry;
use crate::vfs::Vfs;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MAGIC: u32 = 0x5649_4E59;
const TRAILER_LEN: u64 = 8 + 4 + 4;

/// Location and summary of one page within a branch file.
#[derive(Debug, Clone)]
pub struct PageRef {
    pub offset: u64,
    pub len: u32,
    pub meta: PageMeta,
}

/// An immutable, committed branch: footer metadata held in memory,
/// pages read on demand.
#[derive(Debug)]
pub struct Branch {
    id: u64,
    node_id: u64,
    path: PathBuf,
    pages: Vec<PageRef>,
    filter: Option<QuotientFilter>,
    min_lsn: u64,
    max_lsn: u64,
    entry_count: u64,
}

impl Branch {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn min_lsn(&self) -> u64 {
        self.min_lsn
    }

    pub fn max_lsn(&self) -> u64 {
        self.max_lsn
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.pages.first().map(|p| p.meta.min_key.as_slice())
    }

    pub fn last_key(&self) -> Option<&[u8]> {
        self.pages.last().map(|p| p.meta.max_key.as_slice())
    }

    /// Filter probe: `false` means the key is definitely absent.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        match &self.filter {
            Some(filter) => filter.maybe_contains(fingerprint(key)),
            None => true,
        }
    }

    fn read_page(&self, vfs: &dyn Vfs, page: &PageRef) -> Result<Page> {
        let mut buf = vec![0u8; page.len as usize];
        vfs.read_at(&self.path, page.offset, &mut buf)?;
        Page::decode(&buf, &self.path, page.offset)
    }

    /// Newest entry for `key` with `lsn <= max_lsn`. A key's versions
    /// may straddle a page boundary, so the scan continues into the
    /// next page while it still starts with the same key.
    pub fn get(&self, vfs: &dyn Vfs, key: &[u8], max_lsn: u64) -> Result<Option<DiskEntry>> {
        if !self.maybe_contains(key) {
            return Ok(None);
        }
        let mut idx = self
            .pages
            .partition_point(|p| p.meta.max_key.as_slice() < key);
        while idx < self.pages.len() {
            let page_ref = &self.pages[idx];
            if page_ref.meta.min_key.as_slice() > key {
                break;
            }
            let page = self.read_page(vfs, page_ref)?;
            if let Some(entry) = page.find(key, max_lsn) {
                return Ok(Some(entry.clone()));
            }
            // Older versions of the boundary key continue in the next
            // page only if this page ends with the key.
            if page_ref.meta.max_key.as_slice() != key {
                break;
            }
            idx += 1;
        }
        Ok(None)
    }

    /// Streaming cursor over every entry. Ascending yields (key asc,
    /// lsn desc); descending yields (key desc, lsn desc).
    pub fn cursor(
        self: &Arc<Self>,
        vfs: Arc<dyn Vfs>,
        ascending: bool,
        from: Option<Vec<u8>>,
    ) -> BranchCursor {
        let next_page = if ascending {
            match &from {
                Some(key) => self
                    .pages
                    .partition_point(|p| p.meta.max_key.as_slice() < key.as_slice()),
                None => 0,
            }
        } else {
            match &from {
                Some(key) => self
                    .pages
                    .partition_point(|p| p.meta.min_key.as_slice() <= key.as_slice()),
                None => self.pages.len(),
            }
        };
        BranchCursor {
            branch: Arc::clone(self),
            vfs,
            ascending,
            from,
            next_page,
            buffered: Vec::new(),
            boundary: Vec::new(),
        }
    }

    /// Rename a sealed branch to its committed name and open it.
    pub fn commit_seal(
        vfs: &dyn Vfs,
        dir: &Path,
        node_id: u64,
        branch_id: u64,
    ) -> Result<Arc<Branch>> {
        let sealed = seal_path(dir, node_id, branch_id);
        let committed = branch_path(dir, node_id, branch_id);
        vfs.rename(&sealed, &committed)?;
        vfs.sync(&committed)?;
        // The rename is only durable once the directory entry is.
        vfs.sync_dir(dir)?;
        Branch::open(vfs, &committed)
    }

    /// Open a committed branch file: verify the trailer and footer and
    /// load page metadata. Pages are verified lazily on read.
    pub fn open(vfs: &dyn Vfs, path: &Path) -> Result<Arc<Branch>> {
        let file_len = vfs.len(path)?;
        if file_len < TRAILER_LEN {
            return Err(Error::Corruption {
                path: path.display().to_string(),
                detail: format!("file shorter than trailer: {} bytes", file_len),
            });
        }
        let mut trailer = [0u8; TRAILER_LEN as usize];
        vfs.read_at(path, file_len - TRAILER_LEN, &mut trailer)?;
        let mut cursor = Cursor::new(&trailer[..]);
        let footer_off = cursor.read_u64::<BigEndian>()?;
        let footer_len = cursor.read_u32::<BigEndian>()? as u64;
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(Error::Corruption {
                path: path.display().to_string(),
                detail: format!("bad magic {:#010x}", magic),
            });
        }
        if footer_off + footer_len + TRAILER_LEN != file_len {
            return Err(Error::Corruption {
                path: path.display().to_string(),
                detail: "trailer does not agree with file length".to_string(),
            });
        }

        let mut footer = vec![0u8; footer_len as usize];
        vfs.read_at(path, footer_off, &mut footer)?;
        let mut cursor = Cursor::new(footer.as_slice());
        let crc = cursor.read_u32::<BigEndian>()?;
        if crc != CRC.checksum(&footer[4..]) {
            return Err(Error::ChecksumMismatch {
                path: path.display().to_string(),
                offset: footer_off,
            });
        }

        let branch_id = cursor.read_u64::<BigEndian>()?;
        let node_id = cursor.read_u64::<BigEndian>()?;
        let min_lsn = cursor.read_u64::<BigEndian>()?;
        let max_lsn = cursor.read_u64::<BigEndian>()?;
        let entry_count = cursor.read_u64::<BigEndian>()?;

        let filter_len = cursor.read_u32::<BigEndian>()? as usize;
        let filter = if filter_len > 0 {
            let at = cursor.position() as usize;
            let filter = QuotientFilter::decode(&footer[at..at + filter_len])?;
            cursor.set_position((at + filter_len) as u64);
            Some(filter)
        } else {
            None
        };

        let page_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            let offset = cursor.read_u64::<BigEndian>()?;
            let len = cursor.read_u32::<BigEndian>()?;
            let count = cursor.read_u32::<BigEndian>()?;
            let page_min_lsn = cursor.read_u64::<BigEndian>()?;
            let page_max_lsn = cursor.read_u64::<BigEndian>()?;
            let raw_len = cursor.read_u32::<BigEndian>()?;
            let min_key = read_bytes(&mut cursor, &footer)?;
            let max_key = read_bytes(&mut cursor, &footer)?;
            pages.push(PageRef {
                offset,
                len,
                meta: PageMeta {
                    min_key,
                    max_key,
                    min_lsn: page_min_lsn,
                    max_lsn: page_max_lsn,
                    count,
                    raw_len,
                    stored_len: len,
                },
            });
        }

        Ok(Arc::new(Branch {
            id: branch_id,
            node_id,
            path: path.to_path_buf(),
            pages,
            filter,
            min_lsn,
            max_lsn,
            entry_count,
        }))
    }

    /// Deep validation: decode every page, verifying each checksum.
    pub fn validate(&self, vfs: &dyn Vfs) -> Result<()> {
        for page_ref in &self.pages {
            self.read_page(vfs, page_ref)?;
        }
        Ok(())
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, buf: &[u8]) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let at = cursor.position() as usize;
    if at + len > buf.len() {
        return Err(Error::Decode(
            "footer key",
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "key past footer end"),
        ));
    }
    cursor.set_position((at + len) as u64);
    Ok(buf[at..at + len].to_vec())
}

/// Streams a branch page by page.
///
/// Descending order needs one piece of care: a key whose versions
/// straddle a page boundary stores its newer versions in the earlier
/// page, so the lowest-key group of each page is held back until the
/// preceding page has been folded in.
pub struct BranchCursor {
    branch: Arc<Branch>,
    vfs: Arc<dyn Vfs>,
    ascending: bool,
    from: Option<Vec<u8>>,
    next_page: usize,
    buffered: Vec<DiskEntry>,
    boundary: Vec<DiskEntry>,
}

impl BranchCursor {
    fn load_next(&mut self) -> Result<bool> {
        if self.ascending {
            if self.next_page >= self.branch.pages.len() {
                return Ok(false);
            }
            let page_ref = self.branch.pages[self.next_page].clone();
            self.next_page += 1;
            let page = self.branch.read_page(self.vfs.as_ref(), &page_ref)?;
            let mut entries = page.entries;
            if let Some(from) = &self.from {
                entries.retain(|e| e.key.as_slice() >= from.as_slice());
            }
            entries.reverse(); // emit by popping from the back
            self.buffered = entries;
            return Ok(true);
        }

        if self.next_page == 0 {
            // Start of file: whatever was held back is complete.
            if self.boundary.is_empty() {
                return Ok(false);
            }
            self.buffered = std::mem::take(&mut self.boundary);
            self.buffered.reverse();
            return Ok(true);
        }
        self.next_page -= 1;
        let page_ref = self.branch.pages[self.next_page].clone();
        let page = self.branch.read_page(self.vfs.as_ref(), &page_ref)?;
        let mut entries = page.entries;
        if let Some(from) = &self.from {
            entries.retain(|e| e.key.as_slice() <= from.as_slice());
        }
        // Append the held-back group: its versions are older than any
        // in this page for the same key.
        entries.extend(std::mem::take(&mut self.boundary));
        if entries.is_empty() {
            return Ok(true);
        }

        // Hold back the lowest-key group unless this is the first page.
        let low_key = entries[0].key.clone();
        if self.next_page > 0 && entries.iter().all(|e| e.key == low_key) {
            self.boundary = entries;
            return Ok(true);
        }
        if self.next_page > 0 {
            let split = entries.partition_point(|e| e.key == low_key);
            self.boundary = entries.drain(..split).collect();
        }

        // Reorder (key asc, lsn desc) into (key desc, lsn desc): emit
        // key groups back to front, keeping intra-group order.
        let mut out = Vec::with_capacity(entries.len());
        let mut end = entries.len();
        while end > 0 {
            let key = &entries[end - 1].key;
            let start = entries[..end].partition_point(|e| e.key.as_slice() < key.as_slice());
            out.extend_from_slice(&entries[start..end]);
            end = start;
        }
        out.reverse(); // popped from the back
        self.buffered = out;
        Ok(true)
    }
}

impl Iterator for BranchCursor {
    type Item = Result<DiskEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.pop() {
                return Some(Ok(entry));
            }
            match self.load_next() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Writes a new branch through the naming protocol. The caller drives
/// page rotation; `seal` makes the file durable and recoverable.
pub struct BranchBuilder {
    vfs: Arc<dyn Vfs>,
    dir: PathBuf,
    node_id: u64,
    branch_id: u64,
    compression: Compression,
    filter_bits: Option<u8>,
    fingerprints: Vec<u64>,
    page: PageBuilder,
    pages: Vec<PageRef>,
    offset: u64,
    min_lsn: u64,
    max_lsn: u64,
    entry_count: u64,
}

impl BranchBuilder {
    /// `filter_bits` of `None` disables the membership filter.
    pub fn new(
        vfs: Arc<dyn Vfs>,
        dir: &Path,
        node_id: u64,
        branch_id: u64,
        compression: Compression,
        filter_bits: Option<u8>,
    ) -> Result<Self> {
        let path = incomplete_path(dir, node_id, branch_id);
        vfs.write_all(&path, &[])?;
        Ok(Self {
            vfs,
            dir: dir.to_path_buf(),
            node_id,
            branch_id,
            compression,
            filter_bits,
            fingerprints: Vec::new(),
            page: PageBuilder::new(),
            pages: Vec::new(),
            offset: 0,
            min_lsn: u64::MAX,
            max_lsn: 0,
            entry_count: 0,
        })
    }

    pub fn branch_id(&self) -> u64 {
        self.branch_id
    }

    /// Entries must arrive in (key asc, lsn desc) order.
    pub fn add(&mut self, entry: DiskEntry) {
        if self.filter_bits.is_some() {
            let fp = fingerprint(&entry.key);
            if self.fingerprints.last() != Some(&fp) {
                self.fingerprints.push(fp);
            }
        }
        self.min_lsn = self.min_lsn.min(entry.lsn);
        self.max_lsn = self.max_lsn.max(entry.lsn);
        self.entry_count += 1;
        self.page.add(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Flush the current page to disk.
    pub fn end_page(&mut self) -> Result<()> {
        if self.page.is_empty() {
            return Ok(());
        }
        let (bytes, meta) = self.page.finish(self.compression)?;
        let path = incomplete_path(&self.dir, self.node_id, self.branch_id);
        self.vfs.append(&path, &bytes)?;
        self.pages.push(PageRef {
            offset: self.offset,
            len: bytes.len() as u32,
            meta,
        });
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Write footer and trailer, sync, and rename to the sealed name.
    /// After this returns the branch survives a crash.
    pub fn seal(mut self) -> Result<()> {
        self.end_page()?;
        debug_assert!(!self.pages.is_empty());

        let filter_bytes = match self.filter_bits {
            Some(bits) => {
                let mut filter = QuotientFilter::new(self.fingerprints.len(), bits);
                for &fp in &self.fingerprints {
                    filter.insert(fp);
                }
                filter.encode()
            }
            None => Vec::new(),
        };

        let mut footer = Vec::new();
        footer.write_u32::<BigEndian>(0)?; // checksum backfilled below
        footer.write_u64::<BigEndian>(self.branch_id)?;
        footer.write_u64::<BigEndian>(self.node_id)?;
        footer.write_u64::<BigEndian>(self.min_lsn)?;
        footer.write_u64::<BigEndian>(self.max_lsn)?;
        footer.write_u64::<BigEndian>(self.entry_count)?;
        footer.write_u32::<BigEndian>(filter_bytes.len() as u32)?;
        footer.extend_from_slice(&filter_bytes);
        footer.write_u32::<BigEndian>(self.pages.len() as u32)?;
        for page in &self.pages {
            footer.write_u64::<BigEndian>(page.offset)?;
            footer.write_u32::<BigEndian>(page.len)?;
            footer.write_u32::<BigEndian>(page.meta.count)?;
            footer.write_u64::<BigEndian>(page.meta.min_lsn)?;
            footer.write_u64::<BigEndian>(page.meta.max_lsn)?;
            footer.write_u32::<BigEndian>(page.meta.raw_len)?;
            footer.write_u32::<BigEndian>(page.meta.min_key.len() as u32)?;
            footer.extend_from_slice(&page.meta.min_key);
            footer.write_u32::<BigEndian>(page.meta.max_key.len() as u32)?;
            footer.extend_from_slice(&page.meta.max_key);
        }
        let crc = CRC.checksum(&footer[4..]);
        footer[..4].copy_from_slice(&crc.to_be_bytes());

        let mut tail = footer;
        let footer_len = tail.len() as u32;
        tail.write_u64::<BigEndian>(self.offset)?;
        tail.write_u32::<BigEndian>(footer_len)?;
        tail.write_u32::<BigEndian>(MAGIC)?;

        let incomplete = incomplete_path(&self.dir, self.node_id, self.branch_id);
        self.vfs.append(&incomplete, &tail)?;
        self.vfs.sync(&incomplete)?;
        let sealed = seal_path(&self.dir, self.node_id, self.branch_id);
        self.vfs.rename(&incomplete, &sealed)?;
        self.vfs.sync(&sealed)?;
        self.vfs.sync_dir(&self.dir)?;
        debug!(
            node = self.node_id,
            branch = self.branch_id,
            pages = self.pages.len(),
            entries = self.entry_count,
            "sealed branch"
        );
        Ok(())
    }

    /// Discard an in-flight build.
    pub fn abandon(self) -> Result<()> {
        let path = incomplete_path(&self.dir, self.node_id, self.branch_id);
        if self.vfs.exists(&path) {
            self.vfs.unlink(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemFs;

    fn entry(key: &str, value: &str, lsn: u64) -> DiskEntry {
        DiskEntry {
            key: key.into(),
            value: value.into(),
            lsn,
            flags: 0,
        }
    }

    fn fs() -> Arc<dyn Vfs> {
        Arc::new(MemFs::new())
    }

    /// Build, seal and commit a branch with one page per entry group.
    fn build(vfs: &Arc<dyn Vfs>, groups: Vec<Vec<DiskEntry>>) -> Arc<Branch> {
        let dir = Path::new("/db");
        let mut builder = BranchBuilder::new(
            Arc::clone(vfs),
            dir,
            1,
            7,
            Compression::None,
            Some(8),
        )
        .expect("Builder creation failed");
        for group in groups {
            for e in group {
                builder.add(e);
            }
            builder.end_page().expect("Page flush failed");
        }
        builder.seal().expect("Seal failed");
        Branch::commit_seal(vfs.as_ref(), dir, 1, 7).expect("Commit failed")
    }

    #[test]
    fn test_build_open_get() {
        let vfs = fs();
        let branch = build(
            &vfs,
            vec![
                vec![entry("a", "1", 1), entry("b", "2", 2)],
                vec![entry("c", "3", 3), entry("d", "4", 4)],
            ],
        );

        assert_eq!(branch.id(), 7);
        assert_eq!(branch.node_id(), 1);
        assert_eq!(branch.page_count(), 2);
        assert_eq!(branch.entry_count(), 4);
        assert_eq!(branch.first_key(), Some(b"a".as_slice()));
        assert_eq!(branch.last_key(), Some(b"d".as_slice()));

        let got = branch.get(vfs.as_ref(), b"c", u64::MAX).unwrap();
        assert_eq!(got.unwrap().value, b"3");
        assert!(branch.get(vfs.as_ref(), b"x", u64::MAX).unwrap().is_none());
    }

    #[test]
    fn test_reopen_reproduces_page_summaries() {
        let vfs = fs();
        let branch = build(
            &vfs,
            vec![
                vec![entry("a", "1", 4), entry("b", "2", 2)],
                vec![entry("c", "3", 9), entry("d", "4", 1)],
            ],
        );

        let reopened = Branch::open(vfs.as_ref(), branch.path()).expect("Reopen failed");
        assert_eq!(reopened.page_count(), branch.page_count());
        assert_eq!(reopened.entry_count(), branch.entry_count());
        assert_eq!(reopened.min_lsn(), branch.min_lsn());
        assert_eq!(reopened.max_lsn(), branch.max_lsn());
        for (a, b) in branch.pages.iter().zip(reopened.pages.iter()) {
            assert_eq!(a.meta.min_key, b.meta.min_key);
            assert_eq!(a.meta.max_key, b.meta.max_key);
            assert_eq!(a.meta.min_lsn, b.meta.min_lsn);
            assert_eq!(a.meta.max_lsn, b.meta.max_lsn);
            assert_eq!(a.meta.count, b.meta.count);
        }
    }

    #[test]
    fn test_filter_rejects_absent_keys() {
        let vfs = fs();
        let branch = build(&vfs, vec![vec![entry("k1", "v", 1), entry("k2", "v", 2)]]);
        assert!(branch.maybe_contains(b"k1"));
        assert!(branch.maybe_contains(b"k2"));
        let misses = (0..1000)
            .filter(|i| branch.maybe_contains(format!("absent-{}", i).as_bytes()))
            .count();
        assert!(misses < 100, "False-positive rate too high: {}", misses);
    }

    #[test]
    fn test_versions_across_page_boundary() {
        let vfs = fs();
        // Key "k": lsn 9 and 8 end page 0, lsn 5 starts page 1.
        let branch = build(
            &vfs,
            vec![
                vec![entry("a", "av", 1), entry("k", "v9", 9), entry("k", "v8", 8)],
                vec![entry("k", "v5", 5), entry("m", "mv", 2)],
            ],
        );

        assert_eq!(
            branch.get(vfs.as_ref(), b"k", u64::MAX).unwrap().unwrap().value,
            b"v9"
        );
        // Older version lives in the second page.
        assert_eq!(
            branch.get(vfs.as_ref(), b"k", 6).unwrap().unwrap().value,
            b"v5"
        );
        assert!(branch.get(vfs.as_ref(), b"k", 4).unwrap().is_none());
    }

    #[test]
    fn test_ascending_cursor() {
        let vfs = fs();
        let branch = build(
            &vfs,
            vec![
                vec![entry("a", "1", 1), entry("b", "2", 2)],
                vec![entry("c", "3", 3)],
            ],
        );
        let keys: Vec<Vec<u8>> = branch
            .cursor(Arc::clone(&vfs), true, None)
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_ascending_cursor_from_key() {
        let vfs = fs();
        let branch = build(
            &vfs,
            vec![
                vec![entry("a", "1", 1), entry("b", "2", 2)],
                vec![entry("c", "3", 3)],
            ],
        );
        let keys: Vec<Vec<u8>> = branch
            .cursor(Arc::clone(&vfs), true, Some(b"b".to_vec()))
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_descending_cursor_keeps_lsn_order_within_key() {
        let vfs = fs();
        let branch = build(
            &vfs,
            vec![
                vec![entry("a", "av", 1), entry("k", "v9", 9), entry("k", "v8", 8)],
                vec![entry("k", "v5", 5), entry("m", "mv", 2)],
            ],
        );
        let got: Vec<(Vec<u8>, u64)> = branch
            .cursor(Arc::clone(&vfs), false, None)
            .map(|r| {
                let e = r.unwrap();
                (e.key, e.lsn)
            })
            .collect();
        assert_eq!(
            got,
            vec![
                (b"m".to_vec(), 2),
                (b"k".to_vec(), 9),
                (b"k".to_vec(), 8),
                (b"k".to_vec(), 5),
                (b"a".to_vec(), 1),
            ]
        );
    }

    #[test]
    fn test_descending_cursor_from_key() {
        let vfs = fs();
        let branch = build(
            &vfs,
            vec![
                vec![entry("a", "1", 1), entry("b", "2", 2)],
                vec![entry("c", "3", 3)],
            ],
        );
        let keys: Vec<Vec<u8>> = branch
            .cursor(Arc::clone(&vfs), false, Some(b"b".to_vec()))
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_corrupt_footer_rejected() {
        let vfs = fs();
        let branch = build(&vfs, vec![vec![entry("a", "1", 1)]]);
        let path = branch.path().to_path_buf();

        let mut bytes = vfs.read(&path).unwrap();
        let len = bytes.len();
        // Flip a bit inside the footer, before the trailer.
        bytes[len - 20] ^= 0x01;
        vfs.write_all(&path, &bytes).unwrap();

        let err = Branch::open(vfs.as_ref(), &path).expect_err("Must fail");
        assert!(
            matches!(err, Error::ChecksumMismatch { .. } | Error::Corruption { .. }),
            "Unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_truncated_file_rejected() {
        let vfs = fs();
        let branch = build(&vfs, vec![vec![entry("a", "1", 1)]]);
        let path = branch.path().to_path_buf();
        let len = vfs.len(&path).unwrap();
        vfs.truncate(&path, len - 4).unwrap();
        assert!(Branch::open(vfs.as_ref(), &path).is_err());
    }

    #[test]
    fn test_validate_detects_page_corruption() {
        let vfs = fs();
        let branch = build(&vfs, vec![vec![entry("a", "hello", 1)]]);
        branch.validate(vfs.as_ref()).expect("Clean file must pass");

        let path = branch.path().to_path_buf();
        let mut bytes = vfs.read(&path).unwrap();
        bytes[40] ^= 0x80; // inside the first page payload
        vfs.write_all(&path, &bytes).unwrap();

        // Footer still intact, page checksum is not.
        let reopened = Branch::open(vfs.as_ref(), &path).expect("Footer must still parse");
        assert!(reopened.validate(vfs.as_ref()).is_err());
    }

    #[test]
    fn test_abandon_removes_incomplete() {
        let vfs = fs();
        let dir = Path::new("/db");
        let builder = BranchBuilder::new(
            Arc::clone(&vfs),
            dir,
            2,
            3,
            Compression::None,
            None,
        )
        .unwrap();
        assert!(vfs.exists(&incomplete_path(dir, 2, 3)));
        builder.abandon().unwrap();
        assert!(!vfs.exists(&incomplete_path(dir, 2, 3)));
    }
}
