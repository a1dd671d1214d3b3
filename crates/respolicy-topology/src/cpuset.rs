//! Ordered CPU id sets with kernel list syntax.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error produced when parsing a kernel CPU list string.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid CPU list {input:?}: {what}")]
pub struct CpuSetParseError {
    /// The offending input string.
    pub input: String,
    /// What went wrong.
    pub what: String,
}

/// An ordered set of CPU (or memory node) ids.
///
/// Serialized in the kernel list syntax (`"0-3,8"`), which is also the
/// format used in cpuset cgroup files and in configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CpuSet(BTreeSet<u32>);

impl CpuSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Parses the kernel list syntax, e.g. `"0-3,7,9-11"`. Empty input
    /// yields an empty set.
    pub fn parse(s: &str) -> Result<Self, CpuSetParseError> {
        let mut set = BTreeSet::new();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self(set));
        }
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo = Self::parse_id(s, lo)?;
                    let hi = Self::parse_id(s, hi)?;
                    if lo > hi {
                        return Err(CpuSetParseError {
                            input: s.to_string(),
                            what: format!("descending range {}-{}", lo, hi),
                        });
                    }
                    set.extend(lo..=hi);
                }
                None => {
                    set.insert(Self::parse_id(s, part)?);
                }
            }
        }
        Ok(Self(set))
    }

    fn parse_id(input: &str, s: &str) -> Result<u32, CpuSetParseError> {
        s.trim().parse().map_err(|_| CpuSetParseError {
            input: input.to_string(),
            what: format!("bad id {:?}", s),
        })
    }

    /// Number of ids in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the set holds no ids.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Inserts an id.
    pub fn add(&mut self, id: u32) {
        self.0.insert(id);
    }

    /// Removes an id, returns whether it was present.
    pub fn remove(&mut self, id: u32) -> bool {
        self.0.remove(&id)
    }

    /// Membership test.
    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    /// Smallest id, if any.
    pub fn first(&self) -> Option<u32> {
        self.0.iter().next().copied()
    }

    /// Largest id, if any.
    pub fn last(&self) -> Option<u32> {
        self.0.iter().next_back().copied()
    }

    /// Iterates ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    /// Set union.
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Set intersection.
    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Ids present in `self` but not in `other`.
    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).copied().collect())
    }

    /// True if the sets share no ids.
    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.0.is_disjoint(&other.0)
    }

    /// True if every id of `self` is in `other`.
    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Adds all ids of `other` into `self`.
    pub fn extend(&mut self, other: &Self) {
        self.0.extend(other.0.iter().copied());
    }

    /// Removes all ids of `other` from `self`.
    pub fn subtract(&mut self, other: &Self) {
        for id in other.iter() {
            self.0.remove(&id);
        }
    }

    /// Removes and returns the `n` smallest ids (all of them if fewer).
    pub fn take_first(&mut self, n: usize) -> Self {
        let taken: BTreeSet<u32> = self.0.iter().take(n).copied().collect();
        for id in &taken {
            self.0.remove(id);
        }
        Self(taken)
    }
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CpuSet {
    /// Formats in the kernel list syntax with ranges collapsed.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        let mut iter = self.0.iter().copied().peekable();
        while let Some(lo) = iter.next() {
            let mut hi = lo;
            while iter.peek() == Some(&(hi + 1)) {
                hi = iter.next().unwrap();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if lo == hi {
                write!(f, "{}", lo)?;
            } else {
                write!(f, "{}-{}", lo, hi)?;
            }
        }
        Ok(())
    }
}

impl Serialize for CpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        let set = CpuSet::parse("0-3,8,10-11").unwrap();
        assert_eq!(set.len(), 7);
        assert_eq!(set.to_string(), "0-3,8,10-11");
        assert_eq!(CpuSet::parse("").unwrap(), CpuSet::new());
        assert_eq!(CpuSet::parse("5").unwrap().to_string(), "5");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(CpuSet::parse("0-").is_err());
        assert!(CpuSet::parse("a,b").is_err());
        assert!(CpuSet::parse("3-1").is_err());
    }

    #[test]
    fn set_algebra() {
        let a = CpuSet::parse("0-3").unwrap();
        let b = CpuSet::parse("2-5").unwrap();
        assert_eq!(a.union(&b).to_string(), "0-5");
        assert_eq!(a.intersection(&b).to_string(), "2-3");
        assert_eq!(a.difference(&b).to_string(), "0-1");
        assert!(a.intersection(&b).is_subset(&a));
        assert!(!a.is_disjoint(&b));
    }

    #[test]
    fn take_first_removes_lowest_ids() {
        let mut set = CpuSet::parse("1,3,5,7").unwrap();
        let taken = set.take_first(2);
        assert_eq!(taken.to_string(), "1,3");
        assert_eq!(set.to_string(), "5,7");
        assert_eq!(set.take_first(5).to_string(), "5,7");
        assert!(set.is_empty());
    }
}
