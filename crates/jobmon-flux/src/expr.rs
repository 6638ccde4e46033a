//! Validated fragments that get spliced into Flux source.

use crate::error::FluxError;
use jobmon_core::ALLOWED_AGG_FNS;
use jobmon_core::config::is_pipe_clause;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").expect("valid regex"));

/// A bucket, measurement, type or column name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident(String);

impl Ident {
    pub fn new(s: &str) -> Result<Self, FluxError> {
        if IDENT.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(FluxError::InvalidIdentifier(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<self>_<suffix>`, e.g. the measurement written by an aggregation task.
    pub fn suffixed(&self, suffix: &AggFn) -> Self {
        Self(format!("{}_{}", self.0, suffix.as_str()))
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An aggregation function accepted by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggFn(&'static str);

impl AggFn {
    pub fn new(s: &str) -> Result<Self, FluxError> {
        ALLOWED_AGG_FNS
            .iter()
            .copied()
            .find(|allowed| *allowed == s)
            .map(Self)
            .ok_or_else(|| FluxError::UnknownAggFn(s.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for AggFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A pipe-forward clause from the metric configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Clause(String);

impl Clause {
    pub fn new(s: &str) -> Result<Self, FluxError> {
        if is_pipe_clause(s) {
            Ok(Self(s.trim().to_string()))
        } else {
            Err(FluxError::InvalidClause(s.to_string()))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append another clause, e.g. `|> last()` for live queries.
    pub fn then(&self, other: &Clause) -> Self {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other.clone(),
            (_, true) => self.clone(),
            _ => Self(format!("{} {}", self.0, other.0)),
        }
    }
}

/// Hostname filter rendered as a regex alternation between slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeFilter(String);

impl NodeFilter {
    pub fn new<'a>(nodes: impl IntoIterator<Item = &'a str>) -> Result<Self, FluxError> {
        let escaped: Vec<String> = nodes
            .into_iter()
            .filter(|n| !n.is_empty())
            .map(|n| format!("^{}$", regex::escape(n).replace('/', "\\/")))
            .collect();
        if escaped.is_empty() {
            return Err(FluxError::EmptyNodeFilter);
        }
        Ok(Self(escaped.join("|")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Quote `s` as a Flux string literal.
pub fn string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '$' => out.push_str("\\$"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ident() {
        assert!(Ident::new("cpu_load").is_ok());
        assert!(Ident::new("node-metrics.v2").is_ok());
        assert!(Ident::new("").is_err());
        assert!(Ident::new("cpu\") |> drop(").is_err());
        assert!(Ident::new("a b").is_err());
    }

    #[test]
    fn test_agg_fn() {
        assert_eq!(AggFn::new("mean").unwrap().as_str(), "mean");
        assert!(matches!(
            AggFn::new("median"),
            Err(FluxError::UnknownAggFn(_))
        ));
        let m = Ident::new("cpu_load").unwrap();
        assert_eq!(m.suffixed(&AggFn::new("max").unwrap()).as_str(), "cpu_load_max");
    }

    #[test]
    fn test_clause() {
        assert!(Clause::new("").unwrap().is_empty());
        let c = Clause::new("  |> toFloat()  ").unwrap();
        assert_eq!(c.as_str(), "|> toFloat()");
        assert_eq!(
            c.then(&Clause::new("|> last()").unwrap()).as_str(),
            "|> toFloat() |> last()"
        );
        assert_eq!(Clause::default().then(&c), c);
        assert!(Clause::new(r#"|> to(bucket: "x")"#).is_err());
    }

    #[test]
    fn test_node_filter_escapes() {
        let f = NodeFilter::new(["n01", "gpu.02", "a/b"]).unwrap();
        assert_eq!(f.as_str(), r"^n01$|^gpu\.02$|^a\/b$");
        assert!(matches!(
            NodeFilter::new(std::iter::empty()),
            Err(FluxError::EmptyNodeFilter)
        ));
    }

    #[test]
    fn test_string_literal() {
        assert_eq!(string_literal("cpu"), "\"cpu\"");
        assert_eq!(string_literal("a\"b\\c"), "\"a\\\"b\\\\c\"");
        assert_eq!(string_literal("${x}"), "\"\\${x}\"");
    }
}
