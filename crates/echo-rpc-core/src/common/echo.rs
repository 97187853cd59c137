//! Stateless computations behind the four echo RPCs.
//!
//! All arithmetic follows IEEE-754: squaring a large value overflows to
//! infinity and `NaN` propagates. Nothing here performs I/O.

use crate::common::error::{Error, Result};

/// Returns `x * x`.
#[inline]
pub fn square(x: f64) -> f64 {
    x * x
}

/// Sums the squares of `values` in iteration order. An empty input yields
/// `0.0`.
pub fn sum_squares<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    values
        .into_iter()
        .fold(SumOfSquares::default(), |mut acc, x| {
            acc.push(x);
            acc
        })
        .total()
}

/// Running sum of squares for request streams that arrive one unit at a time.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SumOfSquares {
    total: f64,
    count: u64,
}

impl SumOfSquares {
    /// Adds `x * x` to the running total.
    #[inline]
    pub fn push(&mut self, x: f64) {
        self.total += square(x);
        self.count += 1;
    }

    pub const fn total(&self) -> f64 {
        self.total
    }

    /// Number of values folded in so far.
    pub const fn count(&self) -> u64 {
        self.count
    }
}

/// Lazy, finite sequence of squares `0², 1², ..., (k - 1)²` where
/// `k = trunc(n + 1)`.
///
/// Any `n < 0` produces an empty sequence. A fresh sequence is created for
/// every call; it cannot be restarted.
#[derive(Debug, Clone)]
pub struct RangeSquares {
    next: u64,
    end: u64,
}

impl RangeSquares {
    /// Creates the sequence for the request value `n`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if `n` is `NaN` or infinite, since the
    /// sequence would not be finite.
    pub fn new(n: f64) -> Result<Self> {
        if !n.is_finite() {
            return Err(Error::InvalidRequest {
                reason: format!("range bound must be finite, got {n}"),
            });
        }

        let bound = (n + 1.0).trunc();
        // Saturating float to int cast; anything at or below zero is empty.
        let end = if bound > 0.0 { bound as u64 } else { 0 };
        Ok(Self { next: 0, end })
    }

    /// Number of squares still to be produced.
    pub const fn remaining(&self) -> u64 {
        self.end - self.next
    }
}

impl Iterator for RangeSquares {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.next >= self.end {
            return None;
        }
        let i = self.next as f64;
        self.next += 1;
        Some(square(i))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match usize::try_from(self.remaining()) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_matches_ieee_multiplication() {
        assert_eq!(square(0.0), 0.0);
        assert_eq!(square(2.0), 4.0);
        assert_eq!(square(-3.0), 9.0);
        assert_eq!(square(1.5), 2.25);
        assert_eq!(square(f64::MAX), f64::INFINITY);
        assert_eq!(square(f64::NEG_INFINITY), f64::INFINITY);
        assert!(square(f64::NAN).is_nan());
    }

    #[test]
    fn range_yields_n_plus_one_squares_in_order() {
        let values: Vec<f64> = RangeSquares::new(4.0).unwrap().collect();
        assert_eq!(values, vec![0.0, 1.0, 4.0, 9.0, 16.0]);

        let values: Vec<f64> = RangeSquares::new(0.0).unwrap().collect();
        assert_eq!(values, vec![0.0]);

        for n in 0..50_u32 {
            let range = RangeSquares::new(f64::from(n)).unwrap();
            assert_eq!(range.remaining(), u64::from(n) + 1);
        }
    }

    #[test]
    fn range_truncates_fractional_bounds() {
        let values: Vec<f64> = RangeSquares::new(2.7).unwrap().collect();
        assert_eq!(values, vec![0.0, 1.0, 4.0]);

        assert_eq!(RangeSquares::new(-0.5).unwrap().count(), 0);
        assert_eq!(RangeSquares::new(-1.0).unwrap().count(), 0);
        assert_eq!(RangeSquares::new(-12.25).unwrap().count(), 0);
    }

    #[test]
    fn range_rejects_non_finite_bounds() {
        for n in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                RangeSquares::new(n),
                Err(Error::InvalidRequest { .. })
            ));
        }
    }

    #[test]
    fn range_size_hint_is_exact() {
        let mut range = RangeSquares::new(9.0).unwrap();
        assert_eq!(range.size_hint(), (10, Some(10)));
        range.next();
        assert_eq!(range.size_hint(), (9, Some(9)));
    }

    #[test]
    fn sum_of_squares_over_sequences() {
        assert_eq!(sum_squares(Vec::<f64>::new()), 0.0);
        assert!(sum_squares(Vec::<f64>::new()).is_sign_positive());
        assert_eq!(sum_squares([0.0, 1.0, 2.0, 3.0]), 14.0);
        assert_eq!(sum_squares([-2.0, 2.0]), 8.0);
        assert_eq!(sum_squares([f64::MAX, 1.0]), f64::INFINITY);
        assert!(sum_squares([1.0, f64::NAN]).is_nan());
    }

    #[test]
    fn accumulator_tracks_count() {
        let mut acc = SumOfSquares::default();
        acc.push(3.0);
        acc.push(4.0);
        assert_eq!(acc.total(), 25.0);
        assert_eq!(acc.count(), 2);
    }
}
