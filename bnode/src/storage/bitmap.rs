//! Free-node bitmap.
//!
//! One bit per node id: 0 = free, 1 = in use. The persisted copy lives in the
//! head block; this is the in-memory view the tree allocates from. Callers
//! write it back into the head block (and mark the head dirty) after every
//! mutation that changed it.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::node::NodeId;

/// Number of bits per byte.
const BITS_PER_BYTE: usize = 8;

/// Allocation state of every node id of one tree.
#[derive(Debug, Clone)]
pub struct FreeNodeBitmap {
    bits: Vec<u8>,
    /// Node id described by bit 0.
    start_id: NodeId,
    /// Number of ids tracked.
    total: u32,
    free_count: u32,
    /// Bit index at or below which no free bit exists before it.
    hint: u32,
}

impl FreeNodeBitmap {
    /// A bitmap with every id free.
    #[must_use]
    pub fn new(start_id: NodeId, total: u32) -> Self {
        Self {
            bits: vec![0u8; (total as usize).div_ceil(BITS_PER_BYTE)],
            start_id,
            total,
            free_count: total,
            hint: 0,
        }
    }

    /// Build the view over persisted bitmap bytes.
    ///
    /// Counts free ids and places the hint on the first zero bit.
    pub fn build(raw: &[u8], start_id: NodeId, size: u32) -> Result<Self, BitmapError> {
        let needed = (size as usize).div_ceil(BITS_PER_BYTE);
        if raw.len() < needed {
            return Err(BitmapError::TooSmall {
                needed,
                available: raw.len(),
            });
        }
        let mut bits = raw[..needed].to_vec();
        // Bits past `size` in the last byte are not ours.
        let tail = size as usize % BITS_PER_BYTE;
        if tail != 0 {
            if let Some(last) = bits.last_mut() {
                *last &= (1u8 << tail) - 1;
            }
        }

        let used: u32 = bits.iter().map(|b| b.count_ones()).sum();
        let mut bitmap = Self {
            bits,
            start_id,
            total: size,
            free_count: size.saturating_sub(used),
            hint: 0,
        };
        bitmap.hint = bitmap.next_zero(0).unwrap_or(size);
        Ok(bitmap)
    }

    /// Serialize into the persisted bitmap area.
    pub fn write_into(&self, raw: &mut [u8]) {
        let len = self.bits.len().min(raw.len());
        raw[..len].copy_from_slice(&self.bits[..len]);
    }

    /// Allocate the lowest free id at or after the hint.
    pub fn allocate(&mut self) -> Result<NodeId, BitmapError> {
        if self.free_count == 0 {
            return Err(BitmapError::NoSpace);
        }
        let bit = self
            .next_zero(self.hint)
            .or_else(|| self.next_zero(0))
            .ok_or(BitmapError::NoSpace)?;

        set_bit(&mut self.bits, bit as usize);
        self.free_count -= 1;
        self.hint = self.next_zero(bit + 1).unwrap_or(self.total);
        Ok(self.start_id + bit)
    }

    /// Mark a specific id as used (bootstrap of reserved ids).
    pub fn reserve(&mut self, id: NodeId) -> Result<(), BitmapError> {
        let bit = self.bit_index(id)?;
        if !get_bit(&self.bits, bit as usize) {
            set_bit(&mut self.bits, bit as usize);
            self.free_count -= 1;
            if self.hint == bit {
                self.hint = self.next_zero(bit + 1).unwrap_or(self.total);
            }
        }
        Ok(())
    }

    /// Return an id to the free pool.
    ///
    /// The caller guarantees nothing references the node any more.
    pub fn release(&mut self, id: NodeId) -> Result<(), BitmapError> {
        let bit = self.bit_index(id)?;
        if !get_bit(&self.bits, bit as usize) {
            return Err(BitmapError::NotAllocated(id));
        }
        self.hint = self.hint.min(bit);
        self.free_count += 1;
        clear_bit(&mut self.bits, bit as usize);
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, id: NodeId) -> bool {
        self.bit_index(id)
            .is_ok_and(|bit| get_bit(&self.bits, bit as usize))
    }

    #[must_use]
    pub const fn free_count(&self) -> u32 {
        self.free_count
    }

    #[must_use]
    pub const fn total(&self) -> u32 {
        self.total
    }

    #[must_use]
    pub const fn hint(&self) -> u32 {
        self.hint
    }

    /// Every allocated id, ascending.
    #[must_use]
    pub fn allocated_ids(&self) -> Vec<NodeId> {
        (0..self.total)
            .filter(|&bit| get_bit(&self.bits, bit as usize))
            .map(|bit| self.start_id + bit)
            .collect()
    }

    fn bit_index(&self, id: NodeId) -> Result<u32, BitmapError> {
        match id.checked_sub(self.start_id) {
            Some(bit) if bit < self.total => Ok(bit),
            _ => Err(BitmapError::OutOfRange {
                id,
                total: self.total,
            }),
        }
    }

    fn next_zero(&self, from: u32) -> Option<u32> {
        (from..self.total).find(|&bit| !get_bit(&self.bits, bit as usize))
    }
}

/// Get a bit from the bitmap.
fn get_bit(bitmap: &[u8], index: usize) -> bool {
    let byte_index = index / BITS_PER_BYTE;
    let bit_index = index % BITS_PER_BYTE;

    if byte_index >= bitmap.len() {
        return false;
    }

    (bitmap[byte_index] & (1 << bit_index)) != 0
}

/// Set a bit in the bitmap (mark as used).
fn set_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    if byte_index < bitmap.len() {
        bitmap[byte_index] |= 1 << (index % BITS_PER_BYTE);
    }
}

/// Clear a bit in the bitmap (mark as free).
fn clear_bit(bitmap: &mut [u8], index: usize) {
    let byte_index = index / BITS_PER_BYTE;
    if byte_index < bitmap.len() {
        bitmap[byte_index] &= !(1 << (index % BITS_PER_BYTE));
    }
}

/// Errors raised by the free-node bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitmapError {
    /// Every id is in use.
    NoSpace,
    /// Id outside the tracked range.
    OutOfRange { id: NodeId, total: u32 },
    /// Releasing an id that is already free.
    NotAllocated(NodeId),
    /// Persisted area too small for the requested size.
    TooSmall { needed: usize, available: usize },
}

impl std::fmt::Display for BitmapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSpace => write!(f, "no free node ids"),
            Self::OutOfRange { id, total } => {
                write!(f, "node id {id} out of range (tracking {total} ids)")
            }
            Self::NotAllocated(id) => write!(f, "node id {id} is not allocated"),
            Self::TooSmall { needed, available } => write!(
                f,
                "bitmap area too small: need {needed} bytes, have {available}"
            ),
        }
    }
}

impl std::error::Error for BitmapError {}
