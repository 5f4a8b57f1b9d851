use serde::{Deserialize, Serialize};

use crate::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandwidthUnit {
    Kbps = 1000,
    Mbps = 1_000_000,
    Gbps = 1_000_000_000,
}

impl std::fmt::Display for BandwidthUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use BandwidthUnit::*;
        match self {
            Kbps => write!(f, "Kb/s"),
            Mbps => write!(f, "Mb/s"),
            Gbps => write!(f, "Gb/s"),
        }
    }
}

pub trait BandwidthTrait {
    fn kbps(self) -> Bandwidth;
    fn mbps(self) -> Bandwidth;
    fn gbps(self) -> Bandwidth;
}

/// Link speed in bits per second. `unit` only affects how it prints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bandwidth {
    val: u64,
    unit: BandwidthUnit,
}

impl Bandwidth {
    #[inline]
    pub fn val(&self) -> u64 {
        self.val
    }

    /// Nanoseconds to push `nbytes` through a link of this speed. A zero bandwidth never
    /// finishes.
    pub fn transfer_time(&self, nbytes: usize) -> Duration {
        if self.val == 0 {
            return Duration::MAX;
        }
        (nbytes as f64 * 8.0 * 1e9 / self.val as f64).ceil() as Duration
    }
}

impl BandwidthTrait for Bandwidth {
    fn kbps(self) -> Bandwidth {
        Bandwidth {
            unit: BandwidthUnit::Kbps,
            ..self
        }
    }
    fn mbps(self) -> Bandwidth {
        Bandwidth {
            unit: BandwidthUnit::Mbps,
            ..self
        }
    }
    fn gbps(self) -> Bandwidth {
        Bandwidth {
            unit: BandwidthUnit::Gbps,
            ..self
        }
    }
}

impl std::fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}",
            self.val as f64 / self.unit as u64 as f64,
            self.unit
        )
    }
}

impl PartialEq for Bandwidth {
    fn eq(&self, other: &Self) -> bool {
        self.val == other.val
    }
}

impl Eq for Bandwidth {}

impl PartialOrd for Bandwidth {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bandwidth {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.val.cmp(&other.val)
    }
}

macro_rules! impl_bandwidth_trait_for {
    ($($ty:ty),+ $(,)?) => (
        $(impl BandwidthTrait for $ty {
            fn kbps(self) -> Bandwidth {
                scaled(self as f64, BandwidthUnit::Kbps)
            }
            fn mbps(self) -> Bandwidth {
                scaled(self as f64, BandwidthUnit::Mbps)
            }
            fn gbps(self) -> Bandwidth {
                scaled(self as f64, BandwidthUnit::Gbps)
            }
        })+
    )
}

#[inline]
fn scaled(v: f64, unit: BandwidthUnit) -> Bandwidth {
    Bandwidth {
        val: (v * unit as u64 as f64) as u64,
        unit,
    }
}

impl_bandwidth_trait_for!(u32, u64, i32, i64, f32, f64, usize);
