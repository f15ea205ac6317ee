//! Model tier recommendation by installed memory.

use serde::Serialize;
use strum::Display;

/// Below this many GB: Starter.
pub const BALANCED_MIN_GB: u64 = 16;
/// At or above this many GB: Power.
pub const POWER_MIN_GB: u64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum Tier {
    Starter,
    Balanced,
    Power,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub tier: Tier,
    pub model: &'static str,
    pub quant: &'static str,
    pub rationale: &'static str,
}

pub fn recommend(memory_gb: u64) -> Recommendation {
    match memory_gb {
        gb if gb < BALANCED_MIN_GB => Recommendation {
            tier: Tier::Starter,
            model: "Qwen 3 8B",
            quant: "Q4_K_M",
            rationale: "Fast and stable on 8-16 GB",
        },
        gb if gb < POWER_MIN_GB => Recommendation {
            tier: Tier::Balanced,
            model: "Qwen 3 14B",
            quant: "Q4_K_M",
            rationale: "Best quality and speed on 16-24 GB",
        },
        _ => Recommendation {
            tier: Tier::Power,
            model: "Qwen 3 32B",
            quant: "Q4_K_M",
            rationale: "Higher quality on 32 GB+",
        },
    }
}

/// Whole gigabytes from a byte count, rounded, never below 1.
pub fn memory_gb_from_bytes(bytes: u64) -> u64 {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    ((bytes as f64 / GIB).round() as u64).max(1)
}
