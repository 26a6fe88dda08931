//! IMAP message sets
//!
//! A `NumSet` is the client's way of addressing messages: a comma-separated
//! list of numbers and inclusive ranges, where `*` means "the highest
//! number". Whether the numbers are UIDs or sequence numbers is decided by
//! the operation, not the set itself.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// An ordered list of inclusive `(lo, hi)` ranges over message numbers.
/// `*` parses to `u32::MAX`; open ranges like `12:*` therefore map onto
/// the maximum representable value and work directly in `BETWEEN` clauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumSet(Vec<(u32, u32)>);

impl NumSet {
    /// Set containing a single number.
    pub fn single(n: u32) -> Self {
        Self(vec![(n, n)])
    }

    /// Set containing one inclusive range. Bounds are normalized.
    pub fn range(lo: u32, hi: u32) -> Self {
        if lo <= hi {
            Self(vec![(lo, hi)])
        } else {
            Self(vec![(hi, lo)])
        }
    }

    /// The set `1:*`, covering every message.
    pub fn all() -> Self {
        Self(vec![(1, u32::MAX)])
    }

    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.0
    }

    pub fn contains(&self, n: u32) -> bool {
        self.0.iter().any(|&(lo, hi)| lo <= n && n <= hi)
    }

    /// Parse IMAP set syntax, e.g. `1:5,9,12:*`.
    ///
    /// `*` parses to `u32::MAX`. In a range (`12:*`) that works directly as
    /// a `BETWEEN` bound, but a bare `*` yields `(u32::MAX, u32::MAX)` and
    /// matches nothing by itself: the caller must substitute the highest
    /// existing number first (`Store::max_uid` for UID sets).
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::BadNumSet(s.to_string());
        let mut ranges = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(bad());
            }
            let mut bounds = part.splitn(2, ':');
            let lo = parse_num(bounds.next().unwrap_or("")).ok_or_else(bad)?;
            let hi = match bounds.next() {
                Some(h) => parse_num(h).ok_or_else(bad)?,
                None => lo,
            };
            ranges.push(if lo <= hi { (lo, hi) } else { (hi, lo) });
        }
        if ranges.is_empty() {
            return Err(bad());
        }
        Ok(Self(ranges))
    }
}

fn parse_num(s: &str) -> Option<u32> {
    if s == "*" {
        return Some(u32::MAX);
    }
    match s.parse::<u32>() {
        // Message numbers are 1-based; 0 is never valid.
        Ok(0) | Err(_) => None,
        Ok(n) => Some(n),
    }
}

impl FromStr for NumSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for NumSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &(lo, hi)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match (lo, hi) {
                (lo, hi) if lo == hi => write!(f, "{}", lo)?,
                (lo, u32::MAX) => write!(f, "{}:*", lo)?,
                (lo, hi) => write!(f, "{}:{}", lo, hi)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single() {
        assert_eq!(NumSet::parse("7").unwrap(), NumSet::single(7));
    }

    #[test]
    fn test_parse_ranges_and_star() {
        let set = NumSet::parse("1:5,9,12:*").unwrap();
        assert_eq!(set.ranges(), &[(1, 5), (9, 9), (12, u32::MAX)]);
    }

    #[test]
    fn test_parse_reversed_bounds_normalize() {
        assert_eq!(NumSet::parse("5:1").unwrap(), NumSet::range(1, 5));
    }

    #[test]
    fn test_parse_star_alone() {
        let set = NumSet::parse("*").unwrap();
        assert_eq!(set.ranges(), &[(u32::MAX, u32::MAX)]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "a", "1:,3", "0", "1:2:3x", ","] {
            assert!(NumSet::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_contains() {
        let set = NumSet::parse("1:5,9").unwrap();
        assert!(set.contains(3));
        assert!(set.contains(9));
        assert!(!set.contains(6));
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["1:5,9,12:*", "7", "1:*"] {
            assert_eq!(NumSet::parse(s).unwrap().to_string(), s);
        }
    }
}
