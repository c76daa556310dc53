/* -------- Key derivation -------- */
mod fixed_block_key;
pub use fixed_block_key::{mix64, FixedBlockKey, HashMode, KeyDeriver, KEY_LEN};

/* -------- Block layout -------- */
mod fixed_block;
pub use fixed_block::{FixedBlock, BLOCK_LANES};

/* -------- Map -------- */
mod fixed_block_map;
pub use fixed_block_map::{FixedBlockMap, FixedBlockMapInfo, Iter};

#[cfg(test)]
mod proptests;

/* -------- Error type -------- */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixedMapError {
    /// No empty or tombstone lane reachable for a required insertion.
    Full,
    /// `read_from` called on a map with zero blocks.
    Uninitialized,
}

impl std::fmt::Display for FixedMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixedMapError::Full => write!(f, "map overflow: no empty slots available"),
            FixedMapError::Uninitialized => {
                write!(f, "map must be initialized with matching capacity before reading")
            }
        }
    }
}

impl std::error::Error for FixedMapError {}
