//! The statement view: one closed enum over the four physical shapes a
//! key/value record can take inside the engine. Merge, read and write
//! iterators operate on statements so that a memory generation, a
//! decoded page entry, a pending MVCC version and a partially folded
//! upsert chain all flow through the same pipeline.

use std::sync::Arc;

use crate::document::{DocFlags, Document};

/// A record decoded from an on-disk page. Owns its bytes; pages are
/// checksummed and possibly compressed, so entries are materialized on
/// read rather than borrowed from a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lsn: u64,
    pub flags: u8,
}

/// Accumulator for a partially folded upsert chain: the newest
/// statement's key and LSN with the combined value so far.
#[derive(Debug, Clone)]
pub struct FoldState {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lsn: u64,
    pub flags: u8,
}

#[derive(Debug, Clone)]
pub enum Statement {
    /// Raw tuple held by an in-memory generation.
    Mem(Arc<Document>),
    /// Record decoded from an on-disk page.
    Disk(DiskEntry),
    /// Pending MVCC version owned by a transaction.
    Version { doc: Arc<Document>, tx_id: u64 },
    /// Result of folding an upsert chain.
    Fold(FoldState),
}

impl Statement {
    pub fn key(&self) -> &[u8] {
        match self {
            Statement::Mem(doc) => doc.key(),
            Statement::Disk(entry) => &entry.key,
            Statement::Version { doc, .. } => doc.key(),
            Statement::Fold(fold) => &fold.key,
        }
    }

    pub fn value(&self) -> &[u8] {
        match self {
            Statement::Mem(doc) => doc.value(),
            Statement::Disk(entry) => &entry.value,
            Statement::Version { doc, .. } => doc.value(),
            Statement::Fold(fold) => &fold.value,
        }
    }

    pub fn lsn(&self) -> u64 {
        match self {
            Statement::Mem(doc) => doc.lsn(),
            Statement::Disk(entry) => entry.lsn,
            Statement::Version { doc, .. } => doc.lsn(),
            Statement::Fold(fold) => fold.lsn,
        }
    }

    pub fn flags(&self) -> u8 {
        match self {
            Statement::Mem(doc) => doc.flags().0,
            Statement::Disk(entry) => entry.flags,
            Statement::Version { doc, .. } => doc.flags().0,
            Statement::Fold(fold) => fold.flags,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.flags() & DocFlags::DELETE != 0
    }

    pub fn is_upsert(&self) -> bool {
        self.flags() & DocFlags::UPSERT != 0
    }

    /// Byte footprint used by the write iterator's page budget.
    pub fn size(&self) -> usize {
        self.key().len() + self.value().len()
    }

    /// Materialize as a document, e.g. for handing to a cursor caller.
    pub fn to_document(&self) -> Arc<Document> {
        match self {
            Statement::Mem(doc) | Statement::Version { doc, .. } => Arc::clone(doc),
            Statement::Disk(entry) => Document::new(
                entry.key.clone(),
                entry.value.clone(),
                entry.lsn,
                entry.flags,
            ),
            Statement::Fold(fold) => Document::new(
                fold.key.clone(),
                fold.value.clone(),
                fold.lsn,
                fold.flags & !DocFlags::UPSERT,
            ),
        }
    }
}
