//! Disagreement resolution tables.
//!
//! Inputs are in roster order; the first present value belongs to the primary
//! evaluator. These functions do no I/O.

use super::UNCLEAR;

/// A resolved dimension value and whether it needs a human look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<T> {
    pub value: T,
    pub needs_review: bool,
}

/// Resolve ordinal scores on the scale `[min, max]`.
///
/// Spread below `review_gap` takes the mean rounded half up; otherwise the
/// primary's score is kept and the record is flagged. One score is used as is;
/// none yields the scale midpoint, flagged.
pub fn resolve_ordinal(scores: &[Option<u8>], min: u8, max: u8, review_gap: u8) -> Resolution<u8> {
    let present: Vec<u8> = scores.iter().flatten().copied().collect();

    let Some(&primary) = present.first() else {
        return Resolution {
            value: round_half_up(min as u32 + max as u32, 2),
            needs_review: true,
        };
    };
    if present.len() == 1 {
        return Resolution {
            value: primary,
            needs_review: false,
        };
    }

    let lo = present.iter().copied().min().unwrap_or(primary);
    let hi = present.iter().copied().max().unwrap_or(primary);
    if hi - lo < review_gap {
        let sum: u32 = present.iter().map(|&s| s as u32).sum();
        Resolution {
            value: round_half_up(sum, present.len() as u32),
            needs_review: false,
        }
    } else {
        Resolution {
            value: primary,
            needs_review: true,
        }
    }
}

fn round_half_up(sum: u32, n: u32) -> u8 {
    ((2 * sum + n) / (2 * n)) as u8
}

/// Resolve categorical labels.
///
/// Agreement wins; `unclear` yields to a single concrete label; two or more
/// distinct concrete labels collapse to `unclear`.
pub fn resolve_categorical(labels: &[Option<&str>]) -> Resolution<String> {
    let mut concrete: Vec<&str> = Vec::new();
    for label in labels.iter().flatten() {
        if *label != UNCLEAR && !concrete.contains(label) {
            concrete.push(label);
        }
    }

    let value = match concrete.as_slice() {
        [only] => only.to_string(),
        _ => UNCLEAR.to_string(),
    };
    Resolution {
        value,
        needs_review: labels.iter().all(Option::is_none),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_scores_average_half_up() {
        assert_eq!(resolve_ordinal(&[Some(3), Some(4)], 1, 5, 2).value, 4);
        assert_eq!(resolve_ordinal(&[Some(2), Some(2)], 1, 5, 2).value, 2);
        assert!(!resolve_ordinal(&[Some(3), Some(4)], 1, 5, 2).needs_review);
    }

    #[test]
    fn test_wide_gap_keeps_primary_and_flags() {
        let r = resolve_ordinal(&[Some(1), Some(5)], 1, 5, 2);
        assert_eq!(
            r,
            Resolution {
                value: 1,
                needs_review: true
            }
        );
        // Gap of exactly review_gap flags too.
        assert!(resolve_ordinal(&[Some(2), Some(4)], 1, 5, 2).needs_review);
    }

    #[test]
    fn test_review_gap_one_flags_any_disagreement() {
        let r = resolve_ordinal(&[Some(3), Some(4)], 1, 5, 1);
        assert_eq!(r.value, 3);
        assert!(r.needs_review);
    }

    #[test]
    fn test_missing_scores() {
        assert_eq!(resolve_ordinal(&[None, Some(4)], 1, 5, 2).value, 4);
        let none = resolve_ordinal(&[None, None], 1, 5, 2);
        assert_eq!(none.value, 3);
        assert!(none.needs_review);
    }

    #[test]
    fn test_more_than_two_evaluators() {
        assert_eq!(resolve_ordinal(&[Some(2), Some(3), Some(3)], 1, 5, 2).value, 3);
        let r = resolve_ordinal(&[Some(4), Some(2), Some(3)], 1, 5, 2);
        assert_eq!(r.value, 4);
        assert!(r.needs_review);
    }

    #[test]
    fn test_categorical_table() {
        assert_eq!(
            resolve_categorical(&[Some("present"), Some("present")]).value,
            "present"
        );
        assert_eq!(
            resolve_categorical(&[Some("present"), Some("unclear")]).value,
            "present"
        );
        assert_eq!(
            resolve_categorical(&[Some("unclear"), Some("absent")]).value,
            "absent"
        );
        assert_eq!(
            resolve_categorical(&[Some("present"), Some("absent")]).value,
            "unclear"
        );
        assert_eq!(
            resolve_categorical(&[Some("unclear"), Some("unclear")]).value,
            "unclear"
        );
        assert_eq!(resolve_categorical(&[None, Some("followed")]).value, "followed");
        assert!(resolve_categorical(&[None, None]).needs_review);
    }
}
