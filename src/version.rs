//! Package versions.
//!
//! A [`StandardVersion`] is a sequence of numeric and alphabetic components
//! separated by `.`, `-` or `_`. Components compare pairwise:
//!
//! | left \ right | text | number | infinity word |
//! |---|---|---|---|
//! | text | lexical | less | less |
//! | number | greater | numeric | less |
//! | infinity word | greater | greater | `develop > main > master > head > trunk` |
//!
//! When one version is a prefix of the other, the shorter one is smaller, so
//! `1.2 < 1.2.0 < 1.2.1`. Separators are kept for display only: `1.2-3` and
//! `1.2.3` are the same version.
//!
//! A [`GitVersion`] names a source-control reference. It orders like its
//! associated known version when one was given (`git.feature=1.2`), and is
//! otherwise comparable only with itself.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::VersionError;

/// Words that sort above every numeric version, lowest first.
pub const INFINITY_WORDS: [&str; 5] = ["trunk", "head", "master", "main", "develop"];

/// One component of a [`StandardVersion`].
///
/// The variant order is the comparison order between kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Text(String),
    Number(u64),
    /// Index into [`INFINITY_WORDS`].
    Infinity(u8),
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Text(s) => write!(f, "{s}"),
            Component::Number(n) => write!(f, "{n}"),
            Component::Infinity(i) => write!(f, "{}", INFINITY_WORDS[*i as usize]),
        }
    }
}

/// A release version such as `1.2.11`, `2.0rc1` or `develop`.
#[derive(Debug, Clone)]
pub struct StandardVersion {
    text: String,
    components: Vec<Component>,
}

impl StandardVersion {
    /// Parse a version string.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionError::Empty);
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(VersionError::InvalidCharacters(s.to_string()));
        }

        let mut components = Vec::new();
        let bytes = s.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let start = i;
            if bytes[i].is_ascii_digit() {
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let n = s[start..i]
                    .parse::<u64>()
                    .map_err(|_| VersionError::ComponentOverflow(s.to_string()))?;
                components.push(Component::Number(n));
            } else if bytes[i].is_ascii_alphabetic() {
                while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                    i += 1;
                }
                let word = &s[start..i];
                match INFINITY_WORDS.iter().position(|w| *w == word) {
                    Some(idx) => components.push(Component::Infinity(idx as u8)),
                    None => components.push(Component::Text(word.to_string())),
                }
            } else {
                i += 1;
            }
        }
        if components.is_empty() {
            return Err(VersionError::InvalidCharacters(s.to_string()));
        }

        Ok(Self {
            text: s.to_string(),
            components,
        })
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Whether the leading component is an infinity word (`develop`, `main`, ...).
    pub fn is_infinity(&self) -> bool {
        matches!(self.components.first(), Some(Component::Infinity(_)))
    }

    /// Whether every component of `self` is a leading component of `other`.
    ///
    /// `1.2` is a prefix of `1.2` and of `1.2.7`, but not of `1.20`.
    pub fn is_prefix_of(&self, other: &StandardVersion) -> bool {
        self.components.len() <= other.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a == b)
    }
}

impl PartialEq for StandardVersion {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for StandardVersion {}

impl Hash for StandardVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.components.hash(state);
    }
}

impl PartialOrd for StandardVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StandardVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.cmp(&other.components)
    }
}

impl fmt::Display for StandardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A source-control reference, optionally tied to a known release.
#[derive(Debug, Clone)]
pub struct GitVersion {
    reference: String,
    known: Option<StandardVersion>,
    prefixed: bool,
}

impl GitVersion {
    /// Parse `git.<ref>`, `git.<ref>=<version>`, `<ref>=<version>` or a bare
    /// 40-character commit hash.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let prefixed = s.starts_with("git.");
        let body = s.strip_prefix("git.").unwrap_or(s);
        let (reference, known) = match body.split_once('=') {
            Some((r, v)) => (r, Some(StandardVersion::parse(v)?)),
            None => (body, None),
        };
        if reference.is_empty()
            || !reference
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'))
        {
            return Err(VersionError::InvalidCharacters(s.to_string()));
        }
        Ok(Self {
            reference: reference.to_string(),
            known,
            prefixed,
        })
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// The release this reference was declared equivalent to, if any.
    pub fn known_version(&self) -> Option<&StandardVersion> {
        self.known.as_ref()
    }
}

impl PartialEq for GitVersion {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference && self.known == other.known
    }
}

impl Eq for GitVersion {}

impl Hash for GitVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reference.hash(state);
    }
}

impl fmt::Display for GitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefixed {
            write!(f, "git.")?;
        }
        write!(f, "{}", self.reference)?;
        if let Some(known) = &self.known {
            write!(f, "={known}")?;
        }
        Ok(())
    }
}

/// A concrete version: either a release or a source-control reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    Standard(StandardVersion),
    Git(GitVersion),
}

impl Version {
    /// Parse any version string. Strings with a `git.` prefix, an `=` or that
    /// look like a full commit hash become [`Version::Git`].
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let s = s.trim();
        if s.starts_with("git.") || s.contains('=') || is_commit_hash(s) {
            GitVersion::parse(s).map(Version::Git)
        } else {
            StandardVersion::parse(s).map(Version::Standard)
        }
    }

    /// The release this version orders as, if it has one.
    pub fn standard(&self) -> Option<&StandardVersion> {
        match self {
            Version::Standard(v) => Some(v),
            Version::Git(g) => g.known.as_ref(),
        }
    }

    pub fn is_git(&self) -> bool {
        matches!(self, Version::Git(_))
    }

    pub fn is_infinity(&self) -> bool {
        matches!(self, Version::Standard(v) if v.is_infinity())
    }
}

fn is_commit_hash(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

impl PartialOrd for Version {
    /// Releases form a total order. A git reference with a known version sorts
    /// just above that release; one without is only comparable with itself.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Version::Standard(a), Version::Standard(b)) => Some(a.cmp(b)),
            (Version::Git(a), Version::Git(b)) => match (&a.known, &b.known) {
                (Some(ka), Some(kb)) => Some(ka.cmp(kb).then_with(|| a.reference.cmp(&b.reference))),
                _ if a == b => Some(Ordering::Equal),
                _ => None,
            },
            (Version::Git(g), Version::Standard(s)) => {
                g.known.as_ref().map(|k| k.cmp(s).then(Ordering::Greater))
            }
            (Version::Standard(s), Version::Git(g)) => {
                g.known.as_ref().map(|k| s.cmp(k).then(Ordering::Less))
            }
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Standard(v) => write!(f, "{v}"),
            Version::Git(g) => write!(f, "{g}"),
        }
    }
}

impl From<StandardVersion> for Version {
    fn from(v: StandardVersion) -> Self {
        Version::Standard(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sv(s: &str) -> StandardVersion {
        StandardVersion::parse(s).unwrap()
    }

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn numeric_ordering() {
        assert!(sv("1.2.10") > sv("1.2.9"));
        assert!(sv("2.0") > sv("1.99.99"));
        assert_eq!(sv("1.2.3"), sv("1-2_3"));
    }

    #[test]
    fn prefix_is_smaller() {
        assert!(sv("1.2") < sv("1.2.0"));
        assert!(sv("1.2") < sv("1.2a"));
        assert!(sv("1.2").is_prefix_of(&sv("1.2.7")));
        assert!(!sv("1.2").is_prefix_of(&sv("1.20")));
    }

    #[test]
    fn text_below_numbers_and_infinity_above() {
        assert!(sv("1.a") < sv("1.0"));
        assert!(sv("develop") > sv("99999"));
        assert!(sv("develop") > sv("main"));
        assert!(sv("main") > sv("master"));
        assert!(sv("trunk") > sv("2024.1"));
        assert!(sv("develop").is_infinity());
    }

    #[test]
    fn invalid_versions() {
        assert_eq!(StandardVersion::parse(""), Err(VersionError::Empty));
        assert!(matches!(
            StandardVersion::parse("1.2$"),
            Err(VersionError::InvalidCharacters(_))
        ));
        assert!(matches!(
            StandardVersion::parse("99999999999999999999999"),
            Err(VersionError::ComponentOverflow(_))
        ));
    }

    #[test]
    fn display_keeps_original_text() {
        assert_eq!(sv("1.2-3").to_string(), "1.2-3");
        assert_eq!(v("git.feature=1.2").to_string(), "git.feature=1.2");
    }

    #[test]
    fn git_versions_with_known_release() {
        let g = v("git.feature=1.2");
        assert!(g.is_git());
        assert!(g > v("1.2"));
        assert!(g < v("1.2.1"));
        assert_eq!(g.standard(), Some(&sv("1.2")));
    }

    #[test]
    fn bare_git_refs_are_incomparable() {
        let a = v("git.feature");
        let b = v("git.bugfix");
        assert_eq!(a.partial_cmp(&a.clone()), Some(Ordering::Equal));
        assert_eq!(a.partial_cmp(&b), None);
        assert_eq!(a.partial_cmp(&v("1.0")), None);
    }

    #[test]
    fn commit_hash_is_git() {
        let hash = "0123456789abcdef0123456789abcdef01234567";
        assert!(v(hash).is_git());
        assert_eq!(v(hash).to_string(), hash);
    }
}
