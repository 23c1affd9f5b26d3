//! Variant declarations and values.

use std::collections::BTreeSet;
use std::fmt;

use crate::spec::Spec;

/// How many values a variant takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantKind {
    /// `+name` / `~name`.
    Bool,
    /// Exactly one value from the allowed set.
    Single,
    /// A non-empty subset of the allowed set.
    Multi,
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantKind::Bool => write!(f, "boolean"),
            VariantKind::Single => write!(f, "single-valued"),
            VariantKind::Multi => write!(f, "multi-valued"),
        }
    }
}

/// A variant value as written in a spec, or as assigned on a concrete node.
///
/// Requests and conditions may write a boolean as `x=true`; that form is
/// parsed as `Values({"true"})` and normalized by [`VariantValue::normalize`]
/// once the declaration is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariantValue {
    Bool(bool),
    Values(BTreeSet<String>),
}

impl VariantValue {
    /// Build a value list from a `a,b,c` string.
    pub fn from_list(raw: &str) -> Self {
        VariantValue::Values(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    pub fn single(value: impl Into<String>) -> Self {
        VariantValue::Values(BTreeSet::from([value.into()]))
    }

    /// Bring a written value into the canonical shape for `decl`, or return
    /// the first offending value.
    pub fn normalize(&self, decl: &VariantDeclaration) -> Result<VariantValue, String> {
        match (decl.kind, self) {
            (VariantKind::Bool, VariantValue::Bool(b)) => Ok(VariantValue::Bool(*b)),
            (VariantKind::Bool, VariantValue::Values(values)) => {
                match values.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                    ["true" | "True"] => Ok(VariantValue::Bool(true)),
                    ["false" | "False"] => Ok(VariantValue::Bool(false)),
                    _ => Err(self.to_string()),
                }
            }
            (_, VariantValue::Bool(b)) => Err(b.to_string()),
            (VariantKind::Single, VariantValue::Values(values)) if values.len() != 1 => {
                Err(self.to_string())
            }
            (_, VariantValue::Values(values)) => {
                if values.is_empty() {
                    return Err(String::new());
                }
                match values.iter().find(|v| !decl.allowed.contains(*v)) {
                    Some(bad) => Err(bad.clone()),
                    None => Ok(self.clone()),
                }
            }
        }
    }

    /// Whether a concrete value meets a (normalized) constraint.
    ///
    /// Value sets are matched by inclusion: `x=a` holds for a node with
    /// `x=a,b`.
    pub fn satisfies(&self, constraint: &VariantValue) -> bool {
        match (self, constraint) {
            (VariantValue::Bool(a), VariantValue::Bool(b)) => a == b,
            (VariantValue::Values(have), VariantValue::Values(want)) => want.is_subset(have),
            _ => false,
        }
    }

    /// Write the value the way it appears in a spec string for variant `name`.
    pub fn write_assignment(
        &self,
        name: &str,
        propagated: bool,
        f: &mut impl fmt::Write,
    ) -> fmt::Result {
        let (plus, tilde, equals) = if propagated {
            ("++", "~~", "==")
        } else {
            ("+", "~", "=")
        };
        match self {
            VariantValue::Bool(true) => write!(f, "{plus}{name}"),
            VariantValue::Bool(false) => write!(f, "{tilde}{name}"),
            VariantValue::Values(_) => write!(f, "{name}{equals}{self}"),
        }
    }
}

impl fmt::Display for VariantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariantValue::Bool(b) => write!(f, "{b}"),
            VariantValue::Values(values) => {
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{value}")?;
                }
                Ok(())
            }
        }
    }
}

/// A variant a package declares.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantDeclaration {
    pub name: String,
    pub kind: VariantKind,
    pub default: VariantValue,
    /// Allowed values for single and multi variants. Empty for booleans.
    pub allowed: Vec<String>,
    /// The variant exists only on nodes matching this anonymous spec.
    pub when: Spec,
    pub description: Option<String>,
}

impl VariantDeclaration {
    /// A boolean variant that always exists.
    pub fn boolean(name: impl Into<String>, default: bool) -> Self {
        Self {
            name: name.into(),
            kind: VariantKind::Bool,
            default: VariantValue::Bool(default),
            allowed: Vec::new(),
            when: Spec::anonymous(),
            description: None,
        }
    }

    /// A single-valued variant over `allowed`.
    pub fn single(name: impl Into<String>, default: &str, allowed: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: VariantKind::Single,
            default: VariantValue::single(default),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            when: Spec::anonymous(),
            description: None,
        }
    }

    /// A multi-valued variant over `allowed`.
    pub fn multi(name: impl Into<String>, default: &[&str], allowed: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind: VariantKind::Multi,
            default: VariantValue::Values(default.iter().map(|s| s.to_string()).collect()),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            when: Spec::anonymous(),
            description: None,
        }
    }

    /// Restrict the variant to nodes matching `when`.
    pub fn when(mut self, when: Spec) -> Self {
        self.when = when;
        self
    }

    /// Every value a node can take for this variant, in declaration order.
    pub fn domain(&self) -> Vec<VariantValue> {
        match self.kind {
            VariantKind::Bool => vec![VariantValue::Bool(false), VariantValue::Bool(true)],
            _ => self
                .allowed
                .iter()
                .map(|v| VariantValue::single(v.clone()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bool_spellings() {
        let decl = VariantDeclaration::boolean("shared", true);
        assert_eq!(
            VariantValue::single("true").normalize(&decl),
            Ok(VariantValue::Bool(true))
        );
        assert_eq!(
            VariantValue::Bool(false).normalize(&decl),
            Ok(VariantValue::Bool(false))
        );
        assert!(VariantValue::single("maybe").normalize(&decl).is_err());
    }

    #[test]
    fn normalize_single_rejects_unknown_and_multiple() {
        let decl = VariantDeclaration::single("build_type", "Release", &["Debug", "Release"]);
        assert!(VariantValue::single("Debug").normalize(&decl).is_ok());
        assert_eq!(
            VariantValue::single("Fast").normalize(&decl),
            Err("Fast".to_string())
        );
        assert!(
            VariantValue::from_list("Debug,Release")
                .normalize(&decl)
                .is_err()
        );
        assert!(VariantValue::Bool(true).normalize(&decl).is_err());
    }

    #[test]
    fn multi_values_match_by_inclusion() {
        let have = VariantValue::from_list("cxx,fortran");
        assert!(have.satisfies(&VariantValue::single("cxx")));
        assert!(have.satisfies(&VariantValue::from_list("fortran,cxx")));
        assert!(!have.satisfies(&VariantValue::single("java")));
        assert!(!have.satisfies(&VariantValue::Bool(true)));
    }

    #[test]
    fn assignment_syntax() {
        let mut out = String::new();
        VariantValue::Bool(true)
            .write_assignment("x", false, &mut out)
            .unwrap();
        VariantValue::from_list("b,a")
            .write_assignment("langs", false, &mut out)
            .unwrap();
        assert_eq!(out, "+xlangs=a,b");

        out.clear();
        VariantValue::Bool(false)
            .write_assignment("x", true, &mut out)
            .unwrap();
        assert_eq!(out, "~~x");
    }
}
