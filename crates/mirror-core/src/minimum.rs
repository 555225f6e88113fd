//! Minimum-result arithmetic for list and batch fetches.

use crate::error::DataError;

/// How many results a caller insists on before the first resolution.
///
/// A negative count means "all but n" (`total + n`, floored at 1); a percent
/// is taken of the total, rounded up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Minimum {
    Count(i64),
    Percent(f64),
}

impl Minimum {
    /// Parse the string form, e.g. `"25"` or `"80%"`.
    pub fn parse(text: &str) -> Result<Self, DataError> {
        let trimmed = text.trim();
        if let Some(percent) = trimmed.strip_suffix('%') {
            let value: f64 = percent
                .trim()
                .parse()
                .map_err(|_| DataError::InvalidOption(format!("bad minimum: {}", text)))?;
            return Ok(Self::Percent(value));
        }
        let value: i64 = trimmed
            .parse()
            .map_err(|_| DataError::InvalidOption(format!("bad minimum: {}", text)))?;
        Ok(Self::Count(value))
    }

    /// Resolve against a known total.
    pub fn resolve(&self, total: usize) -> usize {
        match *self {
            Self::Count(count) if count < 0 => (total as i64 + count).max(1) as usize,
            Self::Count(count) => count as usize,
            Self::Percent(percent) => ((total as f64) * percent / 100.0).ceil() as usize,
        }
    }
}

impl From<i64> for Minimum {
    fn from(count: i64) -> Self {
        Self::Count(count)
    }
}

/// Resolve an optional minimum, falling back to a default.
pub fn resolve_minimum(minimum: Option<&Minimum>, total: usize, default: usize) -> usize {
    match minimum {
        Some(minimum) => minimum.resolve(total),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count() {
        assert_eq!(Minimum::Count(25).resolve(100), 25);
    }

    #[test]
    fn test_negative_count_floors_at_one() {
        assert_eq!(Minimum::Count(-1).resolve(10), 9);
        assert_eq!(Minimum::Count(-20).resolve(10), 1);
    }

    #[test]
    fn test_percent_rounds_up() {
        assert_eq!(Minimum::Percent(25.0).resolve(10), 3);
        assert_eq!(Minimum::Percent(50.0).resolve(7), 4);
    }

    #[test]
    fn test_parse() {
        assert_eq!(Minimum::parse("25").unwrap(), Minimum::Count(25));
        assert_eq!(Minimum::parse("80%").unwrap(), Minimum::Percent(80.0));
        assert_eq!(Minimum::parse("-1").unwrap(), Minimum::Count(-1));
        assert!(Minimum::parse("abc").is_err());
    }

    #[test]
    fn test_resolve_minimum_default() {
        assert_eq!(resolve_minimum(None, 10, 10), 10);
        assert_eq!(resolve_minimum(Some(&Minimum::Count(3)), 10, 10), 3);
    }
}
