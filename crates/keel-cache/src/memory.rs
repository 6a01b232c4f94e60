use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

/// Rough per-entry footprint of an in-memory tier (key, value, LRU links).
const ENTRY_SIZE_ESTIMATE: u64 = 256;

/// Sizing of in-memory cache tiers, proportional to available memory.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySettings {
    /// Share of the currently available memory one tier may use.
    pub in_memory_cache_fraction: f64,
    pub min_entries: usize,
    pub max_entries: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            in_memory_cache_fraction: 0.02,
            min_entries: 1_000,
            max_entries: 400_000,
        }
    }
}

impl MemorySettings {
    /// Entry capacity for one tier, from the memory available right now.
    pub fn tier_capacity(&self) -> NonZeroUsize {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        self.capacity_for_available(system.available_memory())
    }

    pub fn capacity_for_available(&self, available_bytes: u64) -> NonZeroUsize {
        let fraction = if self.in_memory_cache_fraction.is_finite() {
            self.in_memory_cache_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let budget = (available_bytes as f64 * fraction) as u64;
        let entries = usize::try_from(budget / ENTRY_SIZE_ESTIMATE).unwrap_or(usize::MAX);
        let min = self.min_entries.max(1);
        let max = self.max_entries.max(min);
        NonZeroUsize::new(entries.clamp(min, max)).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_scales_with_available_memory_within_bounds() {
        let settings = MemorySettings {
            in_memory_cache_fraction: 0.5,
            min_entries: 10,
            max_entries: 1_000,
        };
        assert_eq!(settings.capacity_for_available(0).get(), 10);
        assert_eq!(settings.capacity_for_available(256 * 2 * 100).get(), 100);
        assert_eq!(settings.capacity_for_available(u64::MAX).get(), 1_000);
    }

    #[test]
    fn nonsensical_settings_still_yield_a_capacity() {
        let settings = MemorySettings {
            in_memory_cache_fraction: f64::NAN,
            min_entries: 0,
            max_entries: 0,
        };
        assert_eq!(settings.capacity_for_available(1 << 30).get(), 1);
    }
}
