//! Quality scoring for upstream selection.
//!
//! The score combines success ratio, a latency tier, and current in-flight
//! load. Unproven upstreams (no completed requests) score 1000 so new and
//! freshly revived forwarders are tried quickly.

/// Score assigned to an upstream with no completed requests.
pub const UNPROVEN_SCORE: f64 = 1000.0;

/// How many top-scored upstreams the selection window considers.
pub const SELECTION_WINDOW: usize = 13;

/// Success-ratio modifier: 1 when the upstream has never failed, otherwise
/// `good / bad` capped at 1.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn error_modifier(good: u64, bad: u64) -> f64 {
    if bad == 0 {
        1.0
    } else {
        (good as f64 / bad as f64).min(1.0)
    }
}

/// Latency-tier modifier, a step function of average latency in seconds.
#[must_use]
pub fn latency_modifier(avg_latency: f64) -> f64 {
    match avg_latency {
        l if l < 3.0 => 1.0,
        l if l < 4.0 => 0.8,
        l if l < 5.0 => 0.7,
        l if l < 9.0 => 0.6,
        l if l < 10.0 => 0.5,
        l if l < 15.0 => 0.3,
        l if l < 20.0 => 0.1,
        _ => 0.0,
    }
}

/// Computes the selection score for one upstream.
///
/// Each in-flight connection beyond the first subtracts 200 points, pushing
/// selection toward idle upstreams.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn score(good: u64, bad: u64, avg_latency: f64, connections: i64) -> f64 {
    if good + bad == 0 {
        return UNPROVEN_SCORE;
    }

    let load_penalty = ((connections - 1).max(0)) as f64;
    600.0 * error_modifier(good, bad) + 400.0 * latency_modifier(avg_latency) -
        200.0 * load_penalty
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unproven_upstreams_score_1000() {
        assert!((score(0, 0, 0.0, 0) - UNPROVEN_SCORE).abs() < f64::EPSILON);
        assert!((score(0, 0, 0.0, 7) - UNPROVEN_SCORE).abs() < f64::EPSILON);
    }

    #[test]
    fn perfect_upstream_scores_1000() {
        assert!((score(100, 0, 0.5, 1) - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn error_modifier_caps_at_one() {
        assert!((error_modifier(100, 1) - 1.0).abs() < f64::EPSILON);
        assert!((error_modifier(1, 2) - 0.5).abs() < f64::EPSILON);
        assert!((error_modifier(0, 5) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn latency_tiers() {
        assert!((latency_modifier(0.1) - 1.0).abs() < f64::EPSILON);
        assert!((latency_modifier(3.5) - 0.8).abs() < f64::EPSILON);
        assert!((latency_modifier(4.5) - 0.7).abs() < f64::EPSILON);
        assert!((latency_modifier(8.0) - 0.6).abs() < f64::EPSILON);
        assert!((latency_modifier(9.5) - 0.5).abs() < f64::EPSILON);
        assert!((latency_modifier(12.0) - 0.3).abs() < f64::EPSILON);
        assert!((latency_modifier(19.0) - 0.1).abs() < f64::EPSILON);
        assert!((latency_modifier(25.0) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn connections_penalize_past_the_first() {
        let idle = score(10, 0, 1.0, 0);
        let one = score(10, 0, 1.0, 1);
        let three = score(10, 0, 1.0, 3);

        assert!((idle - one).abs() < f64::EPSILON);
        assert!((one - three - 400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failures_rank_below_clean_upstreams() {
        let clean = score(100, 0, 1.0, 1);
        let flaky = score(100, 20, 1.0, 1);
        let broken = score(5, 100, 1.0, 1);

        assert!(clean > flaky);
        assert!(flaky > broken);
    }

    proptest! {
        #[test]
        fn proven_score_is_bounded_above(
            good in 0u64..1_000_000,
            bad in 0u64..1_000_000,
            latency in 0.0f64..100.0,
            connections in 0i64..64,
        ) {
            prop_assume!(good + bad > 0);
            let s = score(good, bad, latency, connections);
            prop_assert!(s <= 1000.0);
        }

        #[test]
        fn more_load_never_raises_the_score(
            good in 1u64..1000,
            bad in 0u64..1000,
            latency in 0.0f64..30.0,
            connections in 0i64..32,
        ) {
            let lighter = score(good, bad, latency, connections);
            let heavier = score(good, bad, latency, connections + 1);
            prop_assert!(heavier <= lighter);
        }
    }
}
