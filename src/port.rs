//! Destination-port selection for UDP probes

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How the destination port is derived from the hop number
///
/// `Fixed` and `Sequential` are deterministic; `Random` draws uniformly from
/// the inclusive `[min, max]` range, re-drawing on excluded ports. Callers
/// are expected to pass feasible exclusion sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PortStrategy {
    /// The same port for every hop
    Fixed { port: u16 },
    /// `start + (hop - 1) * step`
    Sequential { start: u16, step: u16 },
    /// Uniform over `[max(min, 1), min(max, 65535)]` minus `exclude`
    Random {
        min: u16,
        max: u16,
        exclude: BTreeSet<u16>,
    },
}

impl Default for PortStrategy {
    fn default() -> Self {
        PortStrategy::Fixed { port: 33434 }
    }
}

impl PortStrategy {
    /// Classic traceroute base port sequential strategy.
    pub fn traceroute_default() -> Self {
        PortStrategy::Sequential {
            start: 33434,
            step: 1,
        }
    }

    /// Resolve the destination port for a 1-based hop number.
    pub fn resolve(&self, hop: u32) -> u16 {
        match self {
            PortStrategy::Fixed { port } => *port,
            PortStrategy::Sequential { start, step } => {
                start.wrapping_add((hop.wrapping_sub(1) as u16).wrapping_mul(*step))
            }
            PortStrategy::Random { min, max, exclude } => {
                let lo = (*min).max(1);
                let hi = (*max).min(65535);
                let mut rng = rand::rng();
                loop {
                    let port = rng.random_range(lo..=hi);
                    if !exclude.contains(&port) {
                        return port;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_ignores_hop() {
        let strategy = PortStrategy::Fixed { port: 4433 };
        assert_eq!(strategy.resolve(1), 4433);
        assert_eq!(strategy.resolve(30), 4433);
    }

    #[test]
    fn test_sequential_law() {
        let strategy = PortStrategy::Sequential {
            start: 33434,
            step: 2,
        };
        for hop in 1..=30u32 {
            assert_eq!(strategy.resolve(hop), 33434 + (hop as u16 - 1) * 2);
        }
    }

    #[test]
    fn test_sequential_default_base() {
        let strategy = PortStrategy::traceroute_default();
        assert_eq!(strategy.resolve(1), 33434);
        assert_eq!(strategy.resolve(5), 33438);
    }

    #[test]
    fn test_random_within_inclusive_bounds() {
        let strategy = PortStrategy::Random {
            min: 1024,
            max: 1031,
            exclude: BTreeSet::new(),
        };
        for hop in 1..=200 {
            let port = strategy.resolve(hop);
            assert!((1024..=1031).contains(&port));
        }
    }

    #[test]
    fn test_random_honors_exclusions() {
        let exclude: BTreeSet<u16> = (1024..=1027).collect();
        let strategy = PortStrategy::Random {
            min: 1024,
            max: 1028,
            exclude,
        };
        for hop in 1..=100 {
            assert_eq!(strategy.resolve(hop), 1028);
        }
    }

    #[test]
    fn test_random_floor_is_one() {
        let strategy = PortStrategy::Random {
            min: 0,
            max: 1,
            exclude: BTreeSet::new(),
        };
        for hop in 1..=50 {
            assert!(strategy.resolve(hop) >= 1);
        }
    }
}
