use crate::error::RouterError;

pub const DEFAULT_AFFINITY_THRESHOLD: f64 = 0.80;

const VALID_OPTIONS: &str = "AFFINITY, ROUND_ROBIN, RANDOM";

/// Closed set of dispatch strategies, chosen once at construction time.
/// `RoundRobin` and `Random` never touch a worker's tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Policy {
    Affinity { threshold: f64 },
    RoundRobin,
    Random,
}

impl Policy {
    /// Case-insensitive parse; unknown values report the valid options,
    /// same shape as the original `RoutingPolicy.from_str`.
    pub fn from_str(input: &str, affinity_threshold: f64) -> Result<Self, RouterError> {
        let normalized = input.to_uppercase();
        match normalized.as_str() {
            "AFFINITY" => Ok(Policy::Affinity {
                threshold: affinity_threshold,
            }),
            "ROUND_ROBIN" | "ROUNDROBIN" => Ok(Policy::RoundRobin),
            "RANDOM" => Ok(Policy::Random),
            _ => Err(RouterError::InvalidPolicy {
                given: normalized,
                valid: VALID_OPTIONS,
            }),
        }
    }
}
