//! Results reported when the model pipeline could not decide.

use facecheck_core::{policy, ComparisonResult, FallbackPolicy};
use rand::Rng;

/// Distance reported by a fail-closed result: zero confidence on the cosine scale.
const FAIL_CLOSED_DISTANCE: f32 = 1.0;

/// Build the degraded result for `policy`. Always flagged `degraded = true`.
pub fn degraded_result(fallback: FallbackPolicy, threshold: f32, reason: String) -> ComparisonResult {
    degraded_result_with(fallback, threshold, reason, &mut rand::thread_rng())
}

pub(crate) fn degraded_result_with<R: Rng>(
    fallback: FallbackPolicy,
    threshold: f32,
    reason: String,
    rng: &mut R,
) -> ComparisonResult {
    match fallback {
        FallbackPolicy::FailClosed => ComparisonResult {
            matched: false,
            confidence: 0.0,
            distance: FAIL_CLOSED_DISTANCE,
            degraded: true,
            reason: Some(reason),
        },
        FallbackPolicy::Randomized { min, max } => {
            let (lo, hi) = (min.clamp(0.0, 1.0), max.clamp(0.0, 1.0));
            let confidence = if lo < hi { rng.gen_range(lo..=hi) } else { lo };
            ComparisonResult {
                matched: policy::decide(confidence, threshold),
                confidence,
                distance: 1.0 - confidence,
                degraded: true,
                reason: Some(reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_fail_closed() {
        let r = degraded_result(FallbackPolicy::FailClosed, 0.75, "timeout".into());
        assert!(r.degraded);
        assert!(!r.matched);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.distance, 1.0);
        assert_eq!(r.reason.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_randomized_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let r = degraded_result_with(FallbackPolicy::LEGACY_RANDOMIZED, 0.75, "x".into(), &mut rng);
            assert!(r.degraded);
            assert!((0.7..=1.0).contains(&r.confidence), "{}", r.confidence);
            assert!(r.distance >= 0.0);
            assert_eq!(r.matched, r.confidence > 0.75);
        }
    }

    #[test]
    fn test_randomized_degenerate_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let r = degraded_result_with(
            FallbackPolicy::Randomized { min: 0.75, max: 0.75 },
            0.75,
            "x".into(),
            &mut rng,
        );
        assert_eq!(r.confidence, 0.75);
        assert!(!r.matched);
    }
}
