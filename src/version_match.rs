//! Version constraints: unions of ranges and exact pins.
//!
//! The `@...` part of a spec is a comma-separated list of items:
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `1.2:1.4` | every version from `1.2` up to and including anything starting with `1.4` |
//! | `1.2:` / `:1.4` / `:` | half-open or unbounded range |
//! | `1.2` | shorthand for `1.2:1.2`, so it also accepts `1.2.9` |
//! | `=1.2` | exactly `1.2`, not `1.2.9` |
//! | `git.ref=1.2` | exactly that source-control reference |
//!
//! A candidate satisfies the constraint when it satisfies any item.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VersionError;
use crate::version::{StandardVersion, Version};

/// One alternative of a [`VersionConstraint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionItem {
    Exact(Version),
    /// Inclusive lower bound, prefix-inclusive upper bound.
    Range {
        lo: Option<StandardVersion>,
        hi: Option<StandardVersion>,
    },
}

impl VersionItem {
    fn contains(&self, version: &Version) -> bool {
        match self {
            VersionItem::Exact(exact) => exact == version,
            VersionItem::Range { lo, hi } => {
                let Some(v) = version.standard() else {
                    return false;
                };
                lo.as_ref().is_none_or(|lo| v >= lo)
                    && hi.as_ref().is_none_or(|hi| v <= hi || hi.is_prefix_of(v))
            }
        }
    }

    fn intersection(&self, other: &VersionItem) -> Option<VersionItem> {
        match (self, other) {
            (VersionItem::Exact(a), VersionItem::Exact(b)) => (a == b).then(|| self.clone()),
            (VersionItem::Exact(e), range @ VersionItem::Range { .. })
            | (range @ VersionItem::Range { .. }, VersionItem::Exact(e)) => range
                .contains(e)
                .then(|| VersionItem::Exact(e.clone())),
            (
                VersionItem::Range { lo: lo_a, hi: hi_a },
                VersionItem::Range { lo: lo_b, hi: hi_b },
            ) => {
                let lo = match (lo_a, lo_b) {
                    (Some(a), Some(b)) => Some(a.max(b).clone()),
                    (a, b) => a.clone().or_else(|| b.clone()),
                };
                let hi = match (hi_a, hi_b) {
                    (Some(a), Some(b)) => Some(tighter_upper(a, b).clone()),
                    (a, b) => a.clone().or_else(|| b.clone()),
                };
                if range_is_empty(lo.as_ref(), hi.as_ref()) {
                    None
                } else {
                    Some(VersionItem::Range { lo, hi })
                }
            }
        }
    }
}

/// The stricter of two prefix-inclusive upper bounds.
fn tighter_upper<'a>(a: &'a StandardVersion, b: &'a StandardVersion) -> &'a StandardVersion {
    if a.is_prefix_of(b) {
        b
    } else if b.is_prefix_of(a) {
        a
    } else {
        a.min(b)
    }
}

fn range_is_empty(lo: Option<&StandardVersion>, hi: Option<&StandardVersion>) -> bool {
    match (lo, hi) {
        (Some(lo), Some(hi)) => lo > hi && !hi.is_prefix_of(lo),
        _ => false,
    }
}

impl fmt::Display for VersionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionItem::Exact(v @ Version::Git(_)) => write!(f, "{v}"),
            VersionItem::Exact(v) => write!(f, "={v}"),
            VersionItem::Range {
                lo: Some(lo),
                hi: Some(hi),
            } if lo == hi => write!(f, "{lo}"),
            VersionItem::Range { lo, hi } => {
                if let Some(lo) = lo {
                    write!(f, "{lo}")?;
                }
                write!(f, ":")?;
                if let Some(hi) = hi {
                    write!(f, "{hi}")?;
                }
                Ok(())
            }
        }
    }
}

/// A finite union of [`VersionItem`]s. An empty union accepts nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionConstraint {
    items: Vec<VersionItem>,
}

impl VersionConstraint {
    /// Accept every version.
    pub fn any() -> Self {
        Self {
            items: vec![VersionItem::Range { lo: None, hi: None }],
        }
    }

    /// Accept exactly `version`.
    pub fn exact(version: Version) -> Self {
        Self {
            items: vec![VersionItem::Exact(version)],
        }
    }

    /// Accept nothing.
    pub fn none() -> Self {
        Self { items: Vec::new() }
    }

    pub fn items(&self) -> &[VersionItem] {
        &self.items
    }

    pub fn is_any(&self) -> bool {
        self.items
            .iter()
            .any(|i| matches!(i, VersionItem::Range { lo: None, hi: None }))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The pinned version when this constraint is a single exact item.
    pub fn as_exact(&self) -> Option<&Version> {
        match self.items.as_slice() {
            [VersionItem::Exact(v)] => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.items.iter().any(|item| item.contains(version))
    }

    /// A constraint accepting exactly the versions both accept.
    pub fn intersection(&self, other: &VersionConstraint) -> VersionConstraint {
        let mut items: Vec<VersionItem> = Vec::new();
        for a in &self.items {
            for b in &other.items {
                if let Some(item) = a.intersection(b) {
                    if !items.contains(&item) {
                        items.push(item);
                    }
                }
            }
        }
        VersionConstraint { items }
    }

    /// Whether some version could satisfy both constraints.
    pub fn intersects(&self, other: &VersionConstraint) -> bool {
        self.items
            .iter()
            .any(|a| other.items.iter().any(|b| a.intersection(b).is_some()))
    }
}

impl Default for VersionConstraint {
    fn default() -> Self {
        Self::any()
    }
}

impl FromStr for VersionConstraint {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut items = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(VersionError::Empty);
            }
            let item = if let Some(exact) = part.strip_prefix('=') {
                VersionItem::Exact(Version::parse(exact)?)
            } else if let Some((lo, hi)) = part.split_once(':') {
                let lo = (!lo.is_empty())
                    .then(|| StandardVersion::parse(lo))
                    .transpose()?;
                let hi = (!hi.is_empty())
                    .then(|| StandardVersion::parse(hi))
                    .transpose()?;
                if range_is_empty(lo.as_ref(), hi.as_ref()) {
                    return Err(VersionError::EmptyRange(part.to_string()));
                }
                VersionItem::Range { lo, hi }
            } else {
                match Version::parse(part)? {
                    v @ Version::Git(_) => VersionItem::Exact(v),
                    Version::Standard(v) => VersionItem::Range {
                        lo: Some(v.clone()),
                        hi: Some(v),
                    },
                }
            };
            items.push(item);
        }
        Ok(Self { items })
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VersionConstraint> for String {
    fn from(constraint: VersionConstraint) -> Self {
        constraint.to_string()
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> VersionConstraint {
        s.parse().unwrap()
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn upper_bound_is_prefix_inclusive() {
        let range = c(":1.4");
        assert!(range.contains(&v("1.4")));
        assert!(range.contains(&v("1.4.9")));
        assert!(!range.contains(&v("1.5")));
        assert!(!range.contains(&v("1.41")));
    }

    #[test]
    fn bare_version_is_a_prefix_range() {
        let range = c("1.2");
        assert!(range.contains(&v("1.2")));
        assert!(range.contains(&v("1.2.11")));
        assert!(!range.contains(&v("1.3")));
    }

    #[test]
    fn exact_pin() {
        let exact = c("=1.2");
        assert!(exact.contains(&v("1.2")));
        assert!(!exact.contains(&v("1.2.11")));
        assert_eq!(exact.as_exact(), Some(&v("1.2")));
    }

    #[test]
    fn union_of_items() {
        let u = c("1.0:1.2,=2.0");
        assert!(u.contains(&v("1.1")));
        assert!(u.contains(&v("2.0")));
        assert!(!u.contains(&v("1.5")));
    }

    #[test]
    fn lower_bound_is_inclusive() {
        let range = c("2.0:");
        assert!(range.contains(&v("2.0")));
        assert!(range.contains(&v("develop")));
        assert!(!range.contains(&v("1.9")));
    }

    #[test]
    fn empty_range_rejected() {
        assert!(matches!(
            "2.0:1.0".parse::<VersionConstraint>(),
            Err(VersionError::EmptyRange(_))
        ));
        assert!("1.4.2:1.4".parse::<VersionConstraint>().is_ok());
    }

    #[test]
    fn intersection_accepts_exactly_both() {
        let a = c("1.0:2.0");
        let b = c("1.5:");
        let both = a.intersection(&b);
        for version in ["0.9", "1.0", "1.5", "1.7.3", "2.0", "2.0.4", "2.1", "3"] {
            let version = v(version);
            assert_eq!(
                both.contains(&version),
                a.contains(&version) && b.contains(&version),
                "{version}"
            );
        }
    }

    #[test]
    fn intersection_with_prefix_bounds() {
        let both = c(":1.4").intersection(&c(":1.4.2"));
        assert!(both.contains(&v("1.4.2.1")));
        assert!(!both.contains(&v("1.4.3")));
    }

    #[test]
    fn disjoint_intersection_is_empty() {
        let both = c(":1.0").intersection(&c("2.0:"));
        assert!(both.is_empty());
        assert!(!c(":1.0").intersects(&c("2.0:")));
        assert!(c("=1.5").intersects(&c("1:2")));
    }

    #[test]
    fn git_refs_match_only_themselves_or_through_known_version() {
        let known = v("git.feature=1.2");
        assert!(c(":1.3").contains(&known));
        assert!(c("git.feature=1.2").contains(&known));
        assert!(!c(":1.3").contains(&v("git.feature")));
    }

    #[test]
    fn display_round_trip() {
        for text in ["1.2:1.4", ":1.4", "1.2:", ":", "1.2", "=1.2", "git.abc=1.0", "1:2,=3"] {
            assert_eq!(c(text).to_string(), text);
        }
    }
}
