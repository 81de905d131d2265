//! Primary (proposer) selection.
//!
//! The primary rotates backwards through the validator list as the view
//! grows, starting from `height mod N` at view 0. Every validator must agree
//! on the primary for any (height, view) pair, including past and future views.

/// Index of the primary for `view` at `height` with `n` validators.
///
/// Returns 0 for an empty validator list.
pub fn primary_index(height: u32, view: u8, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let n = n as i64;
    (i64::from(height) - i64::from(view)).rem_euclid(n) as usize
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    #[test_case(5, 0, 4, 1; "height five view zero")]
    #[test_case(5, 1, 4, 0; "height five view one")]
    #[test_case(5, 2, 4, 3; "wraps below zero")]
    #[test_case(1, 0, 1, 0; "single validator")]
    #[test_case(0, 255, 7, 4; "view beyond height")]
    #[test_case(u32::MAX, 0, 4, 3; "max height")]
    fn test_primary_index(height: u32, view: u8, n: usize, expected: usize) {
        assert_eq!(primary_index(height, view, n), expected);
    }

    #[test]
    fn test_every_validator_gets_a_turn() {
        let n = 7;
        let mut seen = vec![false; n];
        for view in 0..n as u8 {
            seen[primary_index(100, view, n)] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_consecutive_views_rotate_backwards() {
        for view in 0..20u8 {
            let cur = primary_index(42, view, 4);
            let next = primary_index(42, view + 1, 4);
            assert_eq!((next + 1) % 4, cur);
        }
    }

    #[test]
    fn test_empty_validator_list() {
        assert_eq!(primary_index(10, 3, 0), 0);
    }
}
