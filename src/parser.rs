//! Spec request syntax.
//!
//! ```text
//! specs      := spec { spec }
//! spec       := [name] { node_opt } { '^' [edge_props] name { node_opt } }
//! node_opt   := '@' version_list
//!             | '+' ident | '~' ident | <whitespace> '-' ident
//!             | '++' ident | '~~' ident | <whitespace> '--' ident
//!             | '%' ident [ '@' version_list ]
//!             | ident '=' value              (arch=, platform=, os=, target= or a variant)
//!             | ident '==' value             (a variant propagated to dependencies)
//! edge_props := '[' { ('virtuals' | 'deptypes') '=' list } ']'
//! ```
//!
//! Every `^` constraint attaches to the spec it follows, however deep the
//! package sits in the resulting DAG. Parsing is purely structural: names are
//! not checked against any catalog.

use crate::error::MalformedSpecError;
use crate::spec::{ArchSpec, CompilerSpec, DepKinds, DependencySpec, Spec};
use crate::variant::VariantValue;
use crate::version_match::VersionConstraint;

/// Parse a whitespace-separated list of specs, e.g. `"hdf5+mpi zlib@1.3"`.
pub fn parse_specs(input: &str) -> Result<Vec<Spec>, MalformedSpecError> {
    let mut parser = Parser::new(input);
    let mut specs = Vec::new();
    loop {
        parser.skip_ws();
        if parser.at_end() {
            break;
        }
        let start = parser.pos;
        let spec = parser.spec()?;
        if parser.pos == start {
            return Err(parser.error("expected a spec", start));
        }
        specs.push(spec);
    }
    Ok(specs)
}

/// Parse exactly one spec. An empty string is the anonymous, unconstrained spec.
pub fn parse_spec(input: &str) -> Result<Spec, MalformedSpecError> {
    let mut parser = Parser::new(input);
    let spec = parser.spec()?;
    parser.skip_ws();
    if !parser.at_end() {
        return Err(parser.error("unexpected trailing input", parser.pos));
    }
    Ok(spec)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_version_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':' | '=' | ',' | '/')
}

fn is_value_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ':' | ',' | '/' | '*')
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    /// Skip whitespace, returning whether any was skipped.
    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
        self.pos > start
    }

    /// Consume `c` if it comes next.
    fn eat(&mut self, c: char) -> bool {
        let found = self.peek() == Some(c);
        if found {
            self.bump();
        }
        found
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    /// Build an error whose token is the non-blank run starting at `at`.
    fn error(&self, message: &str, at: usize) -> MalformedSpecError {
        let rest = &self.input[at.min(self.input.len())..];
        let token = rest.split_whitespace().next().unwrap_or("");
        MalformedSpecError {
            message: message.to_string(),
            token: if token.is_empty() {
                "<end of input>".to_string()
            } else {
                token.to_string()
            },
            position: at,
            input: self.input.to_string(),
        }
    }

    fn ident(&mut self, what: &str) -> Result<&'a str, MalformedSpecError> {
        let start = self.pos;
        if !self.peek().is_some_and(is_ident_start) {
            return Err(self.error(&format!("expected {what}"), start));
        }
        Ok(self.take_while(is_ident_char))
    }

    /// Whether the upcoming identifier is followed directly by `=`.
    fn ident_is_key(&self) -> bool {
        let rest = &self.input[self.pos..];
        let len = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
        len > 0 && rest[len..].starts_with('=')
    }

    fn spec(&mut self) -> Result<Spec, MalformedSpecError> {
        self.skip_ws();
        let mut spec = Spec::anonymous();
        if self.peek().is_some_and(is_ident_start) && !self.ident_is_key() {
            spec.name = Some(self.ident("package name")?.to_string());
        }
        self.node_options(&mut spec)?;
        loop {
            let save = self.pos;
            self.skip_ws();
            if self.peek() != Some('^') {
                self.pos = save;
                break;
            }
            self.bump();
            let dep = self.dependency()?;
            spec.dependencies.push(dep);
        }
        Ok(spec)
    }

    fn dependency(&mut self) -> Result<DependencySpec, MalformedSpecError> {
        let mut kinds = None;
        let mut virtuals = Vec::new();
        if self.peek() == Some('[') {
            self.bump();
            loop {
                self.skip_ws();
                match self.peek() {
                    Some(']') => {
                        self.bump();
                        break;
                    }
                    None => return Err(self.error("unterminated edge properties", self.pos)),
                    _ => {}
                }
                let key_at = self.pos;
                let key = self.ident("edge property")?;
                if self.peek() != Some('=') {
                    return Err(self.error("expected `=` after edge property", self.pos));
                }
                self.bump();
                let value_at = self.pos;
                let value = self.take_while(is_value_char);
                if value.is_empty() {
                    return Err(self.error("expected a value", value_at));
                }
                match key {
                    "deptypes" => {
                        let parsed = value
                            .parse::<DepKinds>()
                            .map_err(|_| self.error("unknown dependency type", value_at))?;
                        kinds = Some(parsed);
                    }
                    "virtuals" => {
                        virtuals = value.split(',').map(String::from).collect();
                    }
                    _ => return Err(self.error("unknown edge property", key_at)),
                }
            }
        }
        self.skip_ws();
        let name = self.ident("package name after `^`")?.to_string();
        let mut spec = Spec::named(name);
        self.node_options(&mut spec)?;
        Ok(DependencySpec {
            spec,
            kinds,
            virtuals,
        })
    }

    fn node_options(&mut self, spec: &mut Spec) -> Result<(), MalformedSpecError> {
        loop {
            let save = self.pos;
            let had_ws = self.skip_ws();
            let at = self.pos;
            match self.peek() {
                Some('@') => {
                    self.bump();
                    if !spec.versions.is_any() {
                        return Err(self.error("version constraint given twice", at));
                    }
                    spec.versions = self.version_list()?;
                }
                Some(sign @ ('+' | '~')) => {
                    self.bump();
                    let propagate = self.eat(sign);
                    let name = self.ident("variant name")?;
                    self.set_variant(spec, name, VariantValue::Bool(sign == '+'), propagate, at)?;
                }
                Some('-') if had_ws || at == 0 => {
                    self.bump();
                    let propagate = self.eat('-');
                    let name = self.ident("variant name")?;
                    self.set_variant(spec, name, VariantValue::Bool(false), propagate, at)?;
                }
                Some('%') => {
                    self.bump();
                    if spec.compiler.is_some() {
                        return Err(self.error("compiler given twice", at));
                    }
                    self.skip_ws();
                    let name = self.ident("compiler name")?.to_string();
                    let versions = if self.peek() == Some('@') {
                        self.bump();
                        self.version_list()?
                    } else {
                        VersionConstraint::any()
                    };
                    spec.compiler = Some(CompilerSpec { name, versions });
                }
                Some(c) if is_ident_start(c) && self.ident_is_key() => {
                    let key = self.ident("key")?;
                    self.bump();
                    let propagate = self.eat('=');
                    let value = self.value()?;
                    self.key_value(spec, key, value, propagate, at)?;
                }
                Some(c) if c == '^' || is_ident_start(c) => {
                    self.pos = save;
                    return Ok(());
                }
                None => {
                    self.pos = save;
                    return Ok(());
                }
                Some(_) => return Err(self.error("unexpected character", at)),
            }
        }
    }

    fn version_list(&mut self) -> Result<VersionConstraint, MalformedSpecError> {
        let at = self.pos;
        let text = self.take_while(is_version_char);
        if text.is_empty() {
            return Err(self.error("expected a version after `@`", at));
        }
        text.parse::<VersionConstraint>()
            .map_err(|e| self.error(&format!("invalid version constraint ({e})"), at))
    }

    fn value(&mut self) -> Result<&'a str, MalformedSpecError> {
        let at = self.pos;
        let value = match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.bump();
                let body = self.take_while(|c| c != q);
                if self.peek() != Some(q) {
                    return Err(self.error("unterminated quoted value", at));
                }
                self.bump();
                body
            }
            _ => self.take_while(is_value_char),
        };
        if value.is_empty() {
            return Err(self.error("expected a value after `=`", at));
        }
        Ok(value)
    }

    fn set_variant(
        &self,
        spec: &mut Spec,
        name: &str,
        value: VariantValue,
        propagate: bool,
        at: usize,
    ) -> Result<(), MalformedSpecError> {
        if spec.variants.insert(name.to_string(), value).is_some() {
            return Err(self.error("variant given twice", at));
        }
        if propagate {
            spec.propagated.insert(name.to_string());
        }
        Ok(())
    }

    fn key_value(
        &self,
        spec: &mut Spec,
        key: &str,
        value: &str,
        propagate: bool,
        at: usize,
    ) -> Result<(), MalformedSpecError> {
        let is_arch = matches!(
            key,
            "arch" | "architecture" | "platform" | "os" | "operating_system" | "target"
        );
        if propagate && is_arch {
            return Err(self.error(&format!("`{key}` cannot be propagated"), at));
        }
        let slot = match key {
            "arch" | "architecture" => {
                if !spec.arch.is_empty() {
                    return Err(self.error("architecture given twice", at));
                }
                spec.arch = ArchSpec::from_triple(value)
                    .ok_or_else(|| self.error("invalid architecture", at))?;
                return Ok(());
            }
            "platform" => &mut spec.arch.platform,
            "os" | "operating_system" => &mut spec.arch.os,
            "target" => &mut spec.arch.target,
            _ => {
                return self.set_variant(spec, key, VariantValue::from_list(value), propagate, at);
            }
        };
        if slot.replace(value.to_string()).is_some() {
            return Err(self.error(&format!("`{key}` given twice"), at));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn parse(s: &str) -> Spec {
        parse_spec(s).unwrap()
    }

    #[test]
    fn name_only() {
        let spec = parse("zlib");
        assert_eq!(spec.name(), "zlib");
        assert!(spec.is_unconstrained());
    }

    #[test]
    fn full_node() {
        let spec = parse("hdf5@1.10:1.12+mpi~shared api=v18 %gcc@12: arch=linux-ubuntu22.04-x86_64");
        assert_eq!(spec.name(), "hdf5");
        assert!(spec.versions.contains(&Version::parse("1.12.2").unwrap()));
        assert_eq!(spec.variants["mpi"], VariantValue::Bool(true));
        assert_eq!(spec.variants["shared"], VariantValue::Bool(false));
        assert_eq!(spec.variants["api"], VariantValue::single("v18"));
        let compiler = spec.compiler.as_ref().unwrap();
        assert_eq!(compiler.name, "gcc");
        assert_eq!(spec.arch.os.as_deref(), Some("ubuntu22.04"));
    }

    #[test]
    fn dash_needs_whitespace() {
        let spec = parse("py-numpy -blas");
        assert_eq!(spec.name(), "py-numpy");
        assert_eq!(spec.variants["blas"], VariantValue::Bool(false));
    }

    #[test]
    fn dependencies_attach_to_root() {
        let spec = parse("A ^B@2.0 ^[virtuals=mpi] mpich+fortran");
        assert_eq!(spec.dependencies.len(), 2);
        assert_eq!(spec.dependencies[0].spec.name(), "B");
        let mpich = spec.dependency("mpich").unwrap();
        assert_eq!(mpich.virtuals, vec!["mpi".to_string()]);
        assert_eq!(mpich.spec.variants["fortran"], VariantValue::Bool(true));
    }

    #[test]
    fn propagated_variants() {
        let spec = parse("hdf5++mpi~~shared api==v18 --fortran");
        for name in ["mpi", "shared", "api", "fortran"] {
            assert!(spec.propagated.contains(name), "{name}");
        }
        assert_eq!(spec.variants["mpi"], VariantValue::Bool(true));
        assert_eq!(spec.variants["shared"], VariantValue::Bool(false));
        assert_eq!(spec.variants["fortran"], VariantValue::Bool(false));
        assert_eq!(spec.variants["api"], VariantValue::single("v18"));

        let local = parse("hdf5+mpi ^zlib++shared");
        assert!(local.propagated.is_empty());
        assert!(local.dependencies[0].spec.propagated.contains("shared"));

        assert!(parse_spec("hdf5 target==x86_64").is_err());
        assert!(parse_spec("hdf5+++mpi").is_err());
    }

    #[test]
    fn deptypes_edge_property() {
        let spec = parse("A ^[deptypes=build] cmake");
        assert_eq!(spec.dependencies[0].kinds, Some(DepKinds::BUILD));
    }

    #[test]
    fn anonymous_conditions() {
        let spec = parse("+x %gcc@:4");
        assert!(spec.name.is_none());
        assert_eq!(spec.variants["x"], VariantValue::Bool(true));
        assert!(parse("").is_unconstrained());
        assert_eq!(parse("^mpich").dependencies[0].spec.name(), "mpich");
        assert_eq!(parse("platform=linux").arch.platform.as_deref(), Some("linux"));
    }

    #[test]
    fn multiple_specs() {
        let specs = parse_specs("A+x  B@2 ^C").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].name(), "B");
        assert_eq!(specs[1].dependencies[0].spec.name(), "C");
    }

    #[test]
    fn quoted_values() {
        let spec = parse("A langs='c,cxx'");
        assert_eq!(spec.variants["langs"], VariantValue::from_list("c,cxx"));
    }

    #[test]
    fn error_reports_token_and_position() {
        let err = parse_spec("zlib@1.2 $foo").unwrap_err();
        assert_eq!(err.token, "$foo");
        assert_eq!(err.position, 9);

        let err = parse_spec("zlib@").unwrap_err();
        assert_eq!(err.position, 5);
        assert_eq!(err.token, "<end of input>");
    }

    #[test]
    fn duplicate_constraints_are_errors() {
        assert!(parse_spec("A@1 @2").is_err());
        assert!(parse_spec("A+x~x").is_err());
        assert!(parse_spec("A%gcc %clang").is_err());
        assert!(parse_spec("A target=x86_64 target=aarch64").is_err());
    }

    #[test]
    fn trailing_name_is_error_for_single_spec() {
        let err = parse_spec("A B").unwrap_err();
        assert_eq!(err.token, "B");
        assert_eq!(err.position, 2);
    }

    #[test]
    fn bad_version_range() {
        let err = parse_spec("A@2.0:1.0").unwrap_err();
        assert_eq!(err.position, 2);
        assert!(err.message.contains("version"));
    }

    #[test]
    fn unknown_edge_property() {
        let err = parse_spec("A ^[when=x] B").unwrap_err();
        assert_eq!(err.token, "when=x]");
    }

    #[test]
    fn format_then_parse_is_identity() {
        for text in [
            "A@=1.0+x~y z=a,b %gcc@=12.1.0 arch=linux-ubuntu22.04-x86_64",
            "A ^[deptypes=build] cmake@3.20:",
            "A ^[virtuals=mpi] mpich@=3.0",
            "A++x~~y z==a,b",
            "+x %gcc@:4",
            "B@2:",
        ] {
            let spec = parse(text);
            assert_eq!(spec.to_string(), text);
            assert_eq!(parse(&spec.to_string()), spec);
        }
    }
}
