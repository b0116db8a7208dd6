//! Compact port sets.
//!
//! A [`PortSet`] stores sorted, merged inclusive ranges and iterates them
//! lazily, so `1-65535` costs two integers rather than a 65k element vector.

use crate::{error::Error, types::Port};
use core::{fmt, str::FromStr};

/// Sorted, non-overlapping, inclusive port ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortSet {
    ranges: Vec<(Port, Port)>,
}

impl PortSet {
    pub const fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Builds a set from inclusive `(start, end)` ranges, merging overlapping
    /// and adjacent ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a range is reversed or includes
    /// port 0.
    pub fn from_ranges<I>(ranges: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (Port, Port)>,
    {
        let mut ranges: Vec<_> = ranges.into_iter().collect();
        for &(start, end) in &ranges {
            if start == 0 {
                return Err(Error::invalid("port 0 is not scannable"));
            }
            if start > end {
                return Err(Error::invalid(format!("reversed port range {start}-{end}")));
            }
        }

        ranges.sort_unstable();
        let mut merged: Vec<(Port, Port)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if u32::from(start) <= u32::from(last.1) + 1 => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }

        Ok(Self { ranges: merged })
    }

    /// Every port from 1 to 65535.
    pub fn all() -> Self {
        Self {
            ranges: vec![(1, Port::MAX)],
        }
    }

    /// Number of distinct ports in the set.
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(start, end)| usize::from(end - start) + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates ports in ascending order without materializing them.
    pub fn iter(&self) -> impl Iterator<Item = Port> + '_ {
        self.ranges.iter().flat_map(|&(start, end)| start..=end)
    }
}

impl FromIterator<Port> for PortSet {
    /// Collects individual ports. Port 0 is silently skipped.
    fn from_iter<I: IntoIterator<Item = Port>>(iter: I) -> Self {
        let ranges = iter.into_iter().filter(|&p| p != 0).map(|p| (p, p));
        // Single non-zero ports can't form reversed ranges.
        Self::from_ranges(ranges).unwrap_or_default()
    }
}

/// Parses `22,80,8000-8100`. Whitespace around items is ignored.
impl FromStr for PortSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.trim()
                .parse::<Port>()
                .map_err(|e| Error::invalid(format!("invalid port `{}`: {e}", p.trim())))
        };

        let mut ranges = Vec::new();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let range = match item.split_once('-') {
                Some((start, end)) => (parse_port(start)?, parse_port(end)?),
                None => {
                    let port = parse_port(item)?;
                    (port, port)
                }
            };
            ranges.push(range);
        }

        if ranges.is_empty() {
            return Err(Error::invalid("port set must not be empty"));
        }
        Self::from_ranges(ranges)
    }
}

impl fmt::Display for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &(start, end)) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}
