//! Match decision.

/// A confidence strictly above the threshold is a match.
///
/// Equality is a non-match, and so is a NaN confidence.
pub fn decide(confidence: f32, threshold: f32) -> bool {
    confidence > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_is_not_a_match() {
        assert!(!decide(0.75, 0.75));
    }

    #[test]
    fn test_just_above_is_a_match() {
        let threshold = 0.75f32;
        let above = f32::from_bits(threshold.to_bits() + 1);
        assert!(decide(above, threshold));
        assert!(decide(threshold + 1e-4, threshold));
    }

    #[test]
    fn test_below_and_nan() {
        assert!(!decide(0.5, 0.75));
        assert!(!decide(f32::NAN, 0.75));
    }
}
