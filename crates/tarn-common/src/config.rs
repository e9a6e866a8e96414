//! Configuration structures for TarnDB.

use crate::error::{Result, TarnError};
use serde::{Deserialize, Serialize};

/// Configuration for the trie-based memtable representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemtableConfig {
    /// Number of shard locks protecting per-key version lists.
    /// 0 derives `2 * available_parallelism + 3`.
    pub sharding_count: usize,
    /// Arena budget of the first trie in bytes. Each trie appended after an
    /// arena-exhausted one doubles this budget.
    pub base_block_size: usize,
    /// Maximum number of tries the memtable can chain before it must be
    /// flushed. Reserved up front; appends never reallocate.
    pub trie_capacity: usize,
    /// Number of new keys a trie may gain before a live cursor re-seeks.
    pub cursor_refresh_threshold: usize,
}

impl Default for MemtableConfig {
    fn default() -> Self {
        Self {
            sharding_count: 0,
            base_block_size: 4 * 1024 * 1024, // 4 MB
            trie_capacity: 32,
            cursor_refresh_threshold: 1024,
        }
    }
}

impl MemtableConfig {
    /// Smallest workable trie arena budget.
    pub const MIN_BLOCK_SIZE: usize = 4096;

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.base_block_size < Self::MIN_BLOCK_SIZE {
            return Err(TarnError::InvalidParameter {
                name: "base_block_size".to_string(),
                value: self.base_block_size.to_string(),
            });
        }
        if self.trie_capacity == 0 {
            return Err(TarnError::InvalidParameter {
                name: "trie_capacity".to_string(),
                value: "0".to_string(),
            });
        }
        // Doubling must not overflow across the whole chain.
        if self.trie_capacity > self.base_block_size.leading_zeros() as usize {
            return Err(TarnError::Config(format!(
                "base_block_size {} cannot double across {} tries",
                self.base_block_size, self.trie_capacity
            )));
        }
        Ok(())
    }

    /// Returns the effective shard count, deriving from the host when 0.
    pub fn effective_sharding_count(&self) -> usize {
        if self.sharding_count > 0 {
            self.sharding_count
        } else {
            2 * num_cpus() + 3
        }
    }
}

/// Returns the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memtable_config_defaults() {
        let config = MemtableConfig::default();
        assert_eq!(config.sharding_count, 0);
        assert_eq!(config.base_block_size, 4 * 1024 * 1024);
        assert_eq!(config.trie_capacity, 32);
        assert_eq!(config.cursor_refresh_threshold, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memtable_config_custom() {
        let config = MemtableConfig {
            sharding_count: 17,
            base_block_size: 64 * 1024,
            trie_capacity: 16,
            cursor_refresh_threshold: 256,
        };

        assert!(config.validate().is_ok());
        assert_eq!(config.effective_sharding_count(), 17);
    }

    #[test]
    fn test_undersized_base_block_rejected() {
        for base_block_size in [0, 1, MemtableConfig::MIN_BLOCK_SIZE - 1] {
            let config = MemtableConfig {
                base_block_size,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "accepted {base_block_size}");
        }
        let config = MemtableConfig {
            base_block_size: MemtableConfig::MIN_BLOCK_SIZE,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_trie_capacity_rejected() {
        let config = MemtableConfig {
            trie_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_doubling_overflow_rejected() {
        let config = MemtableConfig {
            base_block_size: usize::MAX / 2,
            trie_capacity: 32,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_sharding_count() {
        let config = MemtableConfig::default();
        let derived = config.effective_sharding_count();
        assert!(derived >= 5, "2 * cpus + 3 must be at least 5");
        assert_eq!(derived % 2, 1, "derived count is always odd");
    }

    #[test]
    fn test_memtable_config_clone() {
        let config1 = MemtableConfig::default();
        let config2 = config1.clone();
        assert_eq!(config1.base_block_size, config2.base_block_size);
        assert_eq!(config1.trie_capacity, config2.trie_capacity);
    }

    #[test]
    fn test_memtable_config_serde_roundtrip() {
        let original = MemtableConfig {
            sharding_count: 9,
            base_block_size: 1 << 20,
            trie_capacity: 8,
            cursor_refresh_threshold: 512,
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: MemtableConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.sharding_count, deserialized.sharding_count);
        assert_eq!(original.base_block_size, deserialized.base_block_size);
        assert_eq!(original.trie_capacity, deserialized.trie_capacity);
        assert_eq!(
            original.cursor_refresh_threshold,
            deserialized.cursor_refresh_threshold
        );
    }

    #[test]
    fn test_num_cpus() {
        let cpus = num_cpus();
        assert!(cpus >= 1, "Should have at least 1 CPU");
    }
}
