//! Quotient filter: a compact approximate-membership structure stored
//! in branch index footers and consulted on point reads to skip
//! branches that definitely do not contain a key.
//!
//! A fingerprint of `q + r` bits is split into a quotient (slot index)
//! and an `r`-bit remainder. Remainders live in a contiguous slot
//! array; collisions shift right within a cluster, tracked by three
//! metadata bits per slot (occupied, continuation, shifted). The
//! filter answers "possibly present" or "definitely absent": false
//! positives shrink with `r`, false negatives never happen.
//!
//! ## Serialized layout
//!
//! ```text
//! +--------+--------+--------+----------------------+
//! | q: u8  | r: u8  | len:u32| slots: len x u16     |
//! +--------+--------+--------+----------------------+
//! ```
//!
//! Each slot packs the three metadata bits above the remainder, so `r`
//! is capped at 13.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

use crate::error::{Error, Result};

const META_OCCUPIED: u16 = 1 << 15;
const META_CONTINUATION: u16 = 1 << 14;
const META_SHIFTED: u16 = 1 << 13;
const META_MASK: u16 = META_OCCUPIED | META_CONTINUATION | META_SHIFTED;

pub const MAX_REMAINDER_BITS: u8 = 13;

#[derive(Debug, Clone)]
pub struct QuotientFilter {
    quotient_bits: u8,
    remainder_bits: u8,
    slots: Vec<u16>,
    entries: usize,
}

/// Stable 64-bit key fingerprint (FNV-1a).
pub fn fingerprint(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl QuotientFilter {
    /// Sizes the filter for `capacity` keys at the given remainder
    /// precision. The slot count rounds up to a power of two and keeps
    /// target load below ~75%; this is tuning policy, the membership
    /// contract holds at any sizing.
    pub fn new(capacity: usize, remainder_bits: u8) -> Self {
        let remainder_bits = remainder_bits.clamp(4, MAX_REMAINDER_BITS);
        let want = (capacity.max(16) * 4) / 3;
        let quotient_bits = (usize::BITS - (want - 1).leading_zeros()).clamp(4, 28) as u8;
        Self {
            quotient_bits,
            remainder_bits,
            slots: vec![0; 1 << quotient_bits],
            entries: 0,
        }
    }

    fn split(&self, hash: u64) -> (usize, u16) {
        let quotient =
            ((hash >> self.remainder_bits) & ((1u64 << self.quotient_bits) - 1)) as usize;
        let remainder = (hash & ((1u64 << self.remainder_bits) - 1)) as u16;
        (quotient, remainder)
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    fn next(&self, i: usize) -> usize {
        (i + 1) & self.mask()
    }

    fn prev(&self, i: usize) -> usize {
        (i + self.slots.len() - 1) & self.mask()
    }

    fn is_empty_slot(&self, i: usize) -> bool {
        self.slots[i] & META_MASK == 0
    }

    fn remainder(&self, i: usize) -> u16 {
        self.slots[i] & !META_MASK
    }

    /// Walk back to the start of the cluster containing slot `i`, then
    /// forward again to locate the start of the run owned by quotient `i`.
    fn run_start(&self, quotient: usize) -> usize {
        let mut b = quotient;
        while self.slots[b] & META_SHIFTED != 0 {
            b = self.prev(b);
        }
        // b is the cluster start; advance one run per occupied bit
        // between the cluster start and our quotient.
        let mut s = b;
        let mut q = b;
        while q != quotient {
            // Skip to the end of the current run.
            loop {
                s = self.next(s);
                if self.slots[s] & META_CONTINUATION == 0 {
                    break;
                }
            }
            // Find the next occupied canonical slot.
            loop {
                q = self.next(q);
                if self.slots[q] & META_OCCUPIED != 0 {
                    break;
                }
            }
        }
        s
    }

    pub fn insert(&mut self, hash: u64) {
        // Refuse to overfill; lookups stay correct, later inserts are
        // simply not remembered once the table saturates. Branch
        // builders size the filter up front so this does not trigger
        // in practice.
        if self.entries + 1 >= self.slots.len() {
            return;
        }
        let (quotient, remainder) = self.split(hash);

        if self.is_empty_slot(quotient) && self.slots[quotient] & META_OCCUPIED == 0 {
            self.slots[quotient] = META_OCCUPIED | remainder;
            self.entries += 1;
            return;
        }

        let had_run = self.slots[quotient] & META_OCCUPIED != 0;
        self.slots[quotient] |= META_OCCUPIED;

        let start = self.run_start(quotient);
        let mut pos = start;

        if had_run {
            // Keep the run sorted by remainder; bail on exact duplicate.
            loop {
                let r = self.remainder(pos);
                if r == remainder {
                    return;
                }
                if r > remainder {
                    break;
                }
                pos = self.next(pos);
                if self.slots[pos] & META_CONTINUATION == 0 {
                    break;
                }
            }
        }

        // Shift everything from `pos` right by one and place the new
        // remainder, fixing up metadata as we go.
        let mut carry = remainder
            | if pos == start && had_run {
                // New head of an existing run: the old head becomes a
                // continuation as it shifts right.
                0
            } else if pos == start {
                0
            } else {
                META_CONTINUATION
            };
        if pos != quotient {
            carry |= META_SHIFTED;
        }

        let mut i = pos;
        loop {
            let displaced = self.slots[i];
            let was_empty = displaced & META_MASK == 0;
            // The occupied bit belongs to the canonical slot, not the
            // slot content that shifts through it.
            let keep_occupied = displaced & META_OCCUPIED;
            self.slots[i] = (carry & !META_OCCUPIED) | keep_occupied;
            if was_empty {
                break;
            }
            carry = (displaced & !META_OCCUPIED) | META_SHIFTED;
            if i == pos && pos == start && had_run {
                carry |= META_CONTINUATION;
            }
            i = self.next(i);
        }

        self.entries += 1;
    }

    pub fn maybe_contains(&self, hash: u64) -> bool {
        let (quotient, remainder) = self.split(hash);
        if self.slots[quotient] & META_OCCUPIED == 0 {
            return false;
        }
        let mut pos = self.run_start(quotient);
        loop {
            let r = self.remainder(pos);
            if r == remainder {
                return true;
            }
            if r > remainder {
                return false;
            }
            pos = self.next(pos);
            if self.slots[pos] & META_CONTINUATION == 0 {
                return false;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + self.slots.len() * 2);
        buf.push(self.quotient_bits);
        buf.push(self.remainder_bits);
        buf.write_u32::<BigEndian>(self.slots.len() as u32).unwrap();
        for &slot in &self.slots {
            buf.write_u16::<BigEndian>(slot).unwrap();
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = io::Cursor::new(data);
        let quotient_bits = cursor
            .read_u8()
            .map_err(|e| Error::Decode("filter quotient bits", e))?;
        let remainder_bits = cursor
            .read_u8()
            .map_err(|e| Error::Decode("filter remainder bits", e))?;
        let len = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("filter slot count", e))? as usize;
        // Bit widths come off disk; bound them before they size a shift.
        if !(4..=28).contains(&quotient_bits)
            || remainder_bits > MAX_REMAINDER_BITS
            || len != 1usize << quotient_bits
        {
            return Err(Error::Decode(
                "filter geometry",
                io::Error::new(io::ErrorKind::InvalidData, "inconsistent filter header"),
            ));
        }
        let mut slots = Vec::with_capacity(len);
        let mut entries = 0;
        for _ in 0..len {
            let slot = cursor
                .read_u16::<BigEndian>()
                .map_err(|e| Error::Decode("filter slot", e))?;
            if slot & META_MASK != 0 {
                entries += 1;
            }
            slots.push(slot);
        }
        Ok(Self {
            quotient_bits,
            remainder_bits,
            slots,
            entries,
        })
    }
}
