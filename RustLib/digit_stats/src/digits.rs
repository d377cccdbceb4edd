use crate::structs::StatsError;

/// Hundredths digit of `quote` as the dashboard shows it: the quote is
/// formatted to two decimals and the final character is taken.
///
/// Rounding follows JavaScript `toFixed(2)`: the exact binary value is
/// rounded to the nearest hundredth and an exact tie goes away from zero.
/// Rust's own `{:.2}` agrees everywhere except on those ties, which can only
/// occur when the fractional part is an odd multiple of 1/8.
pub fn last_digit(quote: f64) -> Result<u8, StatsError> {
    if !quote.is_finite() {
        return Err(StatsError::InvalidArgument(format!(
            "quote must be finite, got {}",
            quote
        )));
    }

    let magnitude = quote.abs();

    if is_hundredths_tie(magnitude) {
        // magnitude * 100 is exact here (at most three fractional bits)
        let hundredths = (magnitude * 100.0).floor() + 1.0;
        return Ok((hundredths % 10.0) as u8);
    }

    let formatted = format!("{:.2}", magnitude);
    formatted
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .map(|d| d as u8)
        .ok_or_else(|| StatsError::InvalidArgument(format!("cannot format quote {}", quote)))
}

fn is_hundredths_tie(magnitude: f64) -> bool {
    let eighths = magnitude * 8.0;
    eighths.fract() == 0.0 && eighths % 2.0 == 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_to_hundredths() {
        assert_eq!(last_digit(1.236).unwrap(), 4);
        assert_eq!(last_digit(1.230).unwrap(), 3);
        assert_eq!(last_digit(0.0).unwrap(), 0);
        assert_eq!(last_digit(1234.5).unwrap(), 0);
        assert_eq!(last_digit(987.654).unwrap(), 5);
    }

    #[test]
    fn test_binary_representation_decides_near_ties() {
        // 1.005 is stored as 1.00499999999999989...
        assert_eq!(last_digit(1.005).unwrap(), 0);
        // 1.235 is stored as 1.23500000000000009...
        assert_eq!(last_digit(1.235).unwrap(), 4);
    }

    #[test]
    fn test_exact_ties_round_away_from_zero() {
        assert_eq!(last_digit(0.125).unwrap(), 3);
        assert_eq!(last_digit(2.375).unwrap(), 8);
        assert_eq!(last_digit(10.625).unwrap(), 3);
        assert_eq!(last_digit(-2.375).unwrap(), 8);
    }

    #[test]
    fn test_integer_and_half_values_are_not_ties() {
        assert_eq!(last_digit(7.0).unwrap(), 0);
        assert_eq!(last_digit(7.5).unwrap(), 0);
        assert_eq!(last_digit(7.25).unwrap(), 5);
    }

    #[test]
    fn test_rejects_non_finite() {
        assert!(last_digit(f64::NAN).is_err());
        assert!(last_digit(f64::INFINITY).is_err());
        assert!(last_digit(f64::NEG_INFINITY).is_err());
    }
}
