use rand::Rng;
use std::ops::RangeInclusive;

use super::session::Session;
use crate::config::ReinforcementConfig;

/// Decides when a working session gets a reflection nudge. The threshold is
/// drawn uniformly from `range` each time it is consumed.
#[derive(Debug, Clone)]
pub struct ReinforcementScheduler {
    range: RangeInclusive<u32>,
}

impl ReinforcementScheduler {
    /// Bounds are normalized: `min` is at least 1 and `max` at least `min`.
    pub fn new(min: u32, max: u32) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self { range: min..=max }
    }

    pub fn from_config(config: &ReinforcementConfig) -> Self {
        if config.min_exchanges == 0 || config.max_exchanges < config.min_exchanges {
            tracing::warn!(
                "Invalid reinforcement range {}..={}, normalizing",
                config.min_exchanges,
                config.max_exchanges
            );
        }
        Self::new(config.min_exchanges, config.max_exchanges)
    }

    pub fn range(&self) -> RangeInclusive<u32> {
        self.range.clone()
    }

    pub fn sample(&self) -> u32 {
        rand::rng().random_range(self.range.clone())
    }

    /// Count one successful exchange. Returns `true` when the nudge is due,
    /// in which case the counter is reset and a new threshold drawn.
    pub fn record_exchange(&self, session: &mut Session) -> bool {
        session.exchange_count += 1;
        if session.exchange_count < session.threshold {
            return false;
        }

        session.exchange_count = 0;
        session.threshold = self.sample();
        tracing::debug!("Reflection due, next threshold {}", session.threshold);
        true
    }
}
