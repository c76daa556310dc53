// src/fixed_block_map.rs
use std::io::{self, Read, Write};
use std::mem;

use bytemuck::{Pod, Zeroable};

use crate::fixed_block::{FixedBlock, BLOCK_LANES, CTRL_EMPTY, CTRL_TOMBSTONE};
use crate::fixed_block_key::FixedBlockKey;
use crate::FixedMapError;

/// Blocks needed for `capacity` slots: ceiling-divide by the lane count,
/// then round up to a power of two (minimum one block).
fn calculate_block_count(capacity: usize) -> usize {
    let blocks = (capacity + BLOCK_LANES - 1) / BLOCK_LANES;
    blocks.max(1).next_power_of_two()
}

/// Point-in-time occupancy snapshot from `collect_info`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedBlockMapInfo {
    /// Ratio of stored entries to total slots.
    pub load_factor: f32,
    /// Ratio of tombstones to total slots.
    pub tombstone_factor: f32,
    /// Set when the tombstone ratio makes a rehash worthwhile.
    pub recommend_rehash: bool,
    /// Set when the load factor makes growth worthwhile.
    pub recommend_grow: bool,
}

/// Fixed-capacity open-addressing map over pre-hashed 128-bit keys.
///
/// Storage is a power-of-two array of 8-lane blocks; every probe scans all
/// 8 control bytes of a block in one word operation and advances linearly
/// with wrap-around. The map never resizes on its own: `put` reports
/// `Full` and growth happens only through `grow`.
///
/// `Default` yields a zero-block shell: lookups miss, `put` fails `Full`,
/// and `read_from` fails `Uninitialized`; use `new` for a working map.
pub struct FixedBlockMap<V> {
    blocks: Vec<FixedBlock<V>>,
    mask: usize,
}

impl<V> Default for FixedBlockMap<V> {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            mask: 0,
        }
    }
}

impl<V: Zeroable> FixedBlockMap<V> {
    /// Allocates a map able to hold at least `capacity` entries. A capacity
    /// of zero still allocates a single block.
    pub fn new(capacity: usize) -> Self {
        let block_count = calculate_block_count(capacity);
        let blocks = std::iter::repeat_with(FixedBlock::zeroed)
            .take(block_count)
            .collect();

        Self {
            blocks,
            mask: block_count - 1,
        }
    }

    /// Total slot capacity: 8 slots per block.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.blocks.len() * BLOCK_LANES
    }

    /// Starting block for a key: the primary hash masked to the block count.
    #[inline]
    fn block_of(&self, key: FixedBlockKey) -> usize {
        (key.primary_hash() as usize) & self.mask
    }

    #[inline]
    fn write_slot(
        &mut self,
        block_index: usize,
        lane: usize,
        key: FixedBlockKey,
        value: V,
    ) {
        let block = &mut self.blocks[block_index];
        block.set_control_byte(lane, key.tag());
        block.keys[lane] = key;
        block.values[lane] = value;
    }

    /// Clears a slot to empty and moves its value out, leaving a zeroed
    /// placeholder behind.
    #[inline]
    fn take_slot(&mut self, block_index: usize, lane: usize) -> V {
        let block = &mut self.blocks[block_index];
        block.set_control_byte(lane, CTRL_EMPTY);
        mem::replace(&mut block.values[lane], V::zeroed())
    }

    /// Walks the probe chain for `key` and returns its (block, lane)
    /// position.
    fn find(&self, key: FixedBlockKey) -> Option<(usize, usize)> {
        if self.blocks.is_empty() {
            return None;
        }

        let start = self.block_of(key);
        let tag = key.tag();
        let mut block_index = start;

        loop {
            let block = &self.blocks[block_index];

            // Parallel scan of the 8 control bytes for the tag.
            let mut result = block.find_tag(tag);
            while result != 0 {
                let lane = result.trailing_zeros() as usize / 8;
                if block.keys[lane] == key {
                    return Some((block_index, lane));
                }
                result &= result - 1;
            }

            // A true empty lane ends the chain: the key cannot live past it.
            if block.has_empty() {
                return None;
            }

            block_index = (block_index + 1) & self.mask;
            if block_index == start {
                return None;
            }
        }
    }

    pub fn get(&self, key: FixedBlockKey) -> Option<&V> {
        self.find(key)
            .map(|(block_index, lane)| &self.blocks[block_index].values[lane])
    }

    pub fn get_mut(&mut self, key: FixedBlockKey) -> Option<&mut V> {
        self.find(key)
            .map(|(block_index, lane)| &mut self.blocks[block_index].values[lane])
    }

    /// Inserts or updates a key. Fails with `Full` only when a complete
    /// wrap of the block array finds neither an empty nor a tombstone lane.
    pub fn put(&mut self, key: FixedBlockKey, value: V) -> Result<(), FixedMapError> {
        if self.blocks.is_empty() {
            return Err(FixedMapError::Full);
        }

        let start = self.block_of(key);
        let tag = key.tag();
        let mut block_index = start;
        let mut first_tombstone: Option<(usize, usize)> = None;

        loop {
            // Key already present: update in place.
            let mut result = self.blocks[block_index].find_tag(tag);
            while result != 0 {
                let lane = result.trailing_zeros() as usize / 8;
                if self.blocks[block_index].keys[lane] == key {
                    self.blocks[block_index].values[lane] = value;
                    return Ok(());
                }
                result &= result - 1;
            }

            // Hunt for a usable lane, remembering the first tombstone on
            // the walk.
            for lane in 0..BLOCK_LANES {
                let ctrl = self.blocks[block_index].control_byte(lane);
                if ctrl == CTRL_EMPTY {
                    // An earlier tombstone keeps the probe chain shorter.
                    let (b, l) = first_tombstone.unwrap_or((block_index, lane));
                    self.write_slot(b, l, key, value);
                    return Ok(());
                }
                if ctrl == CTRL_TOMBSTONE && first_tombstone.is_none() {
                    first_tombstone = Some((block_index, lane));
                }
            }

            block_index = (block_index + 1) & self.mask;
            if block_index == start {
                // Full wrap with no empty anywhere; a remembered tombstone
                // is still a valid home.
                return match first_tombstone {
                    Some((b, l)) => {
                        self.write_slot(b, l, key, value);
                        Ok(())
                    }
                    None => Err(FixedMapError::Full),
                };
            }
        }
    }

    /// Marks the key's slot as deleted. Idempotent; a missing key is a
    /// no-op.
    pub fn delete(&mut self, key: FixedBlockKey) {
        if let Some((block_index, lane)) = self.find(key) {
            self.blocks[block_index].set_control_byte(lane, CTRL_TOMBSTONE);
        }
    }

    /// Visits every occupied slot exactly once, in physical (block, lane)
    /// order. Order is not part of the contract.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            blocks: &self.blocks,
            block_index: 0,
            lane: 0,
        }
    }

    /// Values-only view over `iter`.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    pub fn collect_info(&self) -> FixedBlockMapInfo {
        let mut stored = 0usize;
        let mut tombstones = 0usize;

        for block in &self.blocks {
            for lane in 0..BLOCK_LANES {
                match block.control_byte(lane) {
                    CTRL_EMPTY => {}
                    CTRL_TOMBSTONE => tombstones += 1,
                    _ => stored += 1,
                }
            }
        }

        let total_slots = self.capacity();
        let mut load_factor = 0.0;
        let mut tombstone_factor = 0.0;
        if total_slots > 0 {
            load_factor = stored as f32 / total_slots as f32;
            tombstone_factor = tombstones as f32 / total_slots as f32;
        }

        FixedBlockMapInfo {
            load_factor,
            tombstone_factor,
            recommend_grow: load_factor >= 0.75,
            recommend_rehash: tombstone_factor >= 0.20,
        }
    }

    /// Removes all tombstones and pulls displaced entries back toward their
    /// optimal block, using the table itself as working storage.
    ///
    /// Entries whose optimal block is saturated are parked on a deferred
    /// list and re-inserted through `put` at the end; that final pass can
    /// fail with `Full` on a genuinely saturated table, in which case the
    /// moves already applied stand and entries drained before the failure
    /// stay placed. Check `collect_info` for headroom before rehashing a
    /// nearly-full map.
    pub fn rehash(&mut self) -> Result<(), FixedMapError> {
        // Phase 1: every tombstone becomes empty. Entries whose probe
        // chains crossed those tombstones are re-seated in phase 2.
        for block in &mut self.blocks {
            block.sweep_tombstones();
        }

        // Phase 2: walk blocks in index order, moving each displaced entry
        // into its optimal block when that block has room.
        let mut deferred: Vec<(FixedBlockKey, V)> = Vec::new();
        let mut moves_since_drain = 0usize;

        for block_index in 0..self.blocks.len() {
            for lane in 0..BLOCK_LANES {
                if self.blocks[block_index].control_byte(lane) == CTRL_EMPTY {
                    continue;
                }

                let key = self.blocks[block_index].keys[lane];
                let optimal = self.block_of(key);
                if optimal == block_index {
                    continue;
                }

                if let Some(dest) = self.blocks[optimal].first_empty_lane() {
                    let value = self.take_slot(block_index, lane);
                    self.write_slot(optimal, dest, key, value);
                    moves_since_drain += 1;
                    continue;
                }

                // Optimal block is saturated; park the entry.
                let value = self.take_slot(block_index, lane);
                deferred.push((key, value));
            }

            // Drain once in-place moves have outpaced the parked entries;
            // moves may have opened lanes in previously saturated blocks.
            if moves_since_drain > deferred.len() {
                let mut i = 0;
                while i < deferred.len() {
                    let optimal = self.block_of(deferred[i].0);
                    match self.blocks[optimal].first_empty_lane() {
                        Some(dest) => {
                            let (key, value) = deferred.swap_remove(i);
                            self.write_slot(optimal, dest, key, value);
                        }
                        None => i += 1,
                    }
                }
                moves_since_drain = 0;
            }
        }

        // Whatever is left takes the standard insert path.
        for (key, value) in deferred {
            self.put(key, value)?;
        }

        Ok(())
    }

    /// Extends the map to hold at least `min_capacity` entries. The map
    /// never shrinks; a target at or below the current capacity is a no-op.
    /// The new blocks start empty and the mask change re-seats every entry,
    /// so this also clears tombstones.
    pub fn grow(&mut self, min_capacity: usize) -> Result<(), FixedMapError> {
        let new_block_count = calculate_block_count(min_capacity);
        if new_block_count <= self.blocks.len() {
            return Ok(());
        }

        self.blocks.resize_with(new_block_count, FixedBlock::zeroed);
        self.mask = new_block_count - 1;

        self.rehash()
    }
}

impl<V: Pod> FixedBlockMap<V> {
    /// Byte length of the raw image. Value alignments above 8 would insert
    /// padding into the block layout and leak uninitialized bytes, so those
    /// layouts are rejected up front.
    fn image_len(&self) -> io::Result<usize> {
        let packed = mem::size_of::<u64>()
            + BLOCK_LANES * (mem::size_of::<FixedBlockKey>() + mem::size_of::<V>());
        if mem::size_of::<FixedBlock<V>>() != packed {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "value alignment pads the block layout",
            ));
        }
        Ok(self.blocks.len() * mem::size_of::<FixedBlock<V>>())
    }

    /// Writes the raw memory image of the block array to `sink`: one
    /// contiguous byte range, no framing, no version tag, no endianness
    /// marker. Only a map with the same block count, value layout, and
    /// native byte order can read it back.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<usize> {
        if self.blocks.is_empty() {
            return Ok(0);
        }

        let byte_len = self.image_len()?;
        // SAFETY: the layout check above rules out padding, so every byte
        // in the range is an initialized Pod field byte.
        let bytes =
            unsafe { std::slice::from_raw_parts(self.blocks.as_ptr() as *const u8, byte_len) };

        sink.write_all(bytes)?;
        Ok(byte_len)
    }

    /// Fills the already-allocated block array from `source` with a
    /// full-buffer read; a partial fill is an error. The map must have been
    /// created with the block count the snapshot was written with.
    pub fn read_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        if self.blocks.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                FixedMapError::Uninitialized,
            ));
        }

        let byte_len = self.image_len()?;
        // SAFETY: V is Pod, so a block is valid for any byte pattern; the
        // destination range is uniquely borrowed for the read.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.blocks.as_mut_ptr() as *mut u8, byte_len)
        };

        source.read_exact(bytes)?;
        Ok(byte_len)
    }
}

/// Lazy iterator over occupied slots. Holds a shared borrow of the map, so
/// no mutation is possible while it lives.
pub struct Iter<'a, V> {
    blocks: &'a [FixedBlock<V>],
    block_index: usize,
    lane: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (FixedBlockKey, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.block_index < self.blocks.len() {
            let block = &self.blocks[self.block_index];
            while self.lane < BLOCK_LANES {
                let lane = self.lane;
                self.lane += 1;

                let ctrl = block.control_byte(lane);
                if ctrl != CTRL_EMPTY && ctrl != CTRL_TOMBSTONE {
                    return Some((block.keys[lane], &block.values[lane]));
                }
            }
            self.lane = 0;
            self.block_index += 1;
        }
        None
    }
}
