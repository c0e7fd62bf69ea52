use std::collections::HashMap;

use rand::Rng;

const GLOBAL_WINDOW_MS: i64 = 1_000;
const PER_NAME_WINDOW_MS: i64 = 60_000;
/// Ceiling on tracked per-name windows before stale ones are swept.
const MAX_TRACKED_NAMES: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateVerdict {
    Admitted,
    GlobalLimited,
    NameLimited,
}

struct NameWindow {
    window_start_ms: i64,
    count: u32,
}

/// Wall-clock window counters for the global and per-name ceilings. A
/// window resets when the next event observes that it has elapsed; no
/// timers are involved.
pub struct RateCounters {
    global_ceiling: u32,
    per_name_ceiling: u32,
    global_window_start_ms: i64,
    global_count: u32,
    per_name: HashMap<String, NameWindow>,
    session_counts: HashMap<String, u64>,
}

impl RateCounters {
    pub fn new(global_ceiling: u32, per_name_ceiling: u32) -> Self {
        RateCounters {
            global_ceiling,
            per_name_ceiling,
            global_window_start_ms: 0,
            global_count: 0,
            per_name: HashMap::new(),
            session_counts: HashMap::new(),
        }
    }

    /// Count one event against both windows and report whether it fit.
    pub fn check_and_count(&mut self, name: &str, now_ms: i64) -> RateVerdict {
        self.note(name);

        if now_ms - self.global_window_start_ms >= GLOBAL_WINDOW_MS {
            self.global_window_start_ms = now_ms;
            self.global_count = 0;
        }
        self.global_count += 1;
        if self.global_count > self.global_ceiling {
            return RateVerdict::GlobalLimited;
        }

        if self.per_name.len() >= MAX_TRACKED_NAMES && !self.per_name.contains_key(name) {
            self.per_name
                .retain(|_, window| now_ms - window.window_start_ms < PER_NAME_WINDOW_MS);
        }
        let window = self.per_name.entry(name.to_string()).or_insert(NameWindow {
            window_start_ms: now_ms,
            count: 0,
        });
        if now_ms - window.window_start_ms >= PER_NAME_WINDOW_MS {
            window.window_start_ms = now_ms;
            window.count = 0;
        }
        window.count += 1;
        if window.count > self.per_name_ceiling {
            return RateVerdict::NameLimited;
        }

        RateVerdict::Admitted
    }

    /// Bump the cumulative per-name session count without touching the
    /// rate windows. Critical events are counted here only.
    pub fn note(&mut self, name: &str) {
        *self.session_counts.entry(name.to_string()).or_default() += 1;
    }

    pub fn session_counts(&self) -> &HashMap<String, u64> {
        &self.session_counts
    }

    /// Forgets windows and session counts, used on session rotation.
    pub fn reset(&mut self) {
        self.global_window_start_ms = 0;
        self.global_count = 0;
        self.per_name.clear();
        self.session_counts.clear();
    }
}

/// One uniform draw against `rate`. Rates at or above 1.0 skip the draw.
pub fn sample(rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    rand::thread_rng().gen::<f64>() < rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_window_caps_and_resets() {
        let mut counters = RateCounters::new(3, 100);
        let mut now = 10_000;

        for i in 0..3 {
            assert_eq!(
                counters.check_and_count(&format!("event_{i}"), now),
                RateVerdict::Admitted
            );
        }
        assert_eq!(
            counters.check_and_count("event_over", now),
            RateVerdict::GlobalLimited
        );

        now += GLOBAL_WINDOW_MS;
        assert_eq!(
            counters.check_and_count("event_next", now),
            RateVerdict::Admitted
        );
    }

    #[test]
    fn per_name_window_caps_and_resets() {
        let mut counters = RateCounters::new(1_000, 2);
        let mut now = 10_000;

        assert_eq!(counters.check_and_count("cta_click", now), RateVerdict::Admitted);
        now += 10;
        assert_eq!(counters.check_and_count("cta_click", now), RateVerdict::Admitted);
        now += 10;
        assert_eq!(counters.check_and_count("cta_click", now), RateVerdict::NameLimited);
        // other names are unaffected
        assert_eq!(counters.check_and_count("page_view", now), RateVerdict::Admitted);

        now += PER_NAME_WINDOW_MS;
        assert_eq!(counters.check_and_count("cta_click", now), RateVerdict::Admitted);
    }

    #[test]
    fn session_counts_accumulate_across_outcomes() {
        let mut counters = RateCounters::new(1, 100);
        counters.check_and_count("cta_click", 0);
        counters.check_and_count("cta_click", 0);
        counters.note("$session_start");

        assert_eq!(counters.session_counts()["cta_click"], 2);
        assert_eq!(counters.session_counts()["$session_start"], 1);

        counters.reset();
        assert!(counters.session_counts().is_empty());
    }

    #[test]
    fn sampling_extremes_are_deterministic() {
        assert!(sample(1.0));
        assert!(sample(1.5));
        assert!(!sample(0.0));
        assert!(!sample(-0.2));
    }
}
