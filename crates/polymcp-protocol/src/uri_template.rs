//! URI templates for resource-template keys.
//!
//! Supports the RFC 6570 Level 1 subset used by MCP resource templates:
//!
//! - `{var}` matches exactly one path segment (no `/`)
//! - `{var*}` matches greedily across segments
//! - `{?a,b}` query groups are stripped from the match pattern; the variable
//!   names are kept as metadata
//!
//! Templates compile to an anchored regex at construction time, so `get` on
//! a registry is a plain regex match with no per-lookup parsing.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use regex::Regex;
use thiserror::Error;

/// Errors from template compilation.
#[derive(Debug, Clone, Error)]
pub enum UriTemplateError {
    /// A `{` without a matching `}` (or vice versa).
    #[error("unbalanced braces in URI template: {0}")]
    UnbalancedBraces(String),

    /// An expression with an empty or malformed variable name.
    #[error("invalid variable expression '{{{0}}}'")]
    InvalidVariable(String),
}

/// A compiled URI template.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    raw: String,
    pattern: Regex,
    variables: Vec<String>,
    query_variables: Vec<String>,
}

impl UriTemplate {
    /// Compile a template string.
    pub fn parse(template: &str) -> Result<Self, UriTemplateError> {
        let mut pattern = String::from("^");
        let mut variables = Vec::new();
        let mut query_variables = Vec::new();

        let mut rest = template;
        while let Some(open) = rest.find('{') {
            pattern.push_str(&regex::escape(&rest[..open]));
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| UriTemplateError::UnbalancedBraces(template.to_string()))?;
            let expr = &after[..close];

            if let Some(query) = expr.strip_prefix('?') {
                // Query expansion: contributes nothing to the match pattern.
                for name in query.split(',') {
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(UriTemplateError::InvalidVariable(expr.to_string()));
                    }
                    query_variables.push(name.to_string());
                }
            } else if let Some(name) = expr.strip_suffix('*') {
                Self::check_variable_name(name, expr)?;
                variables.push(name.to_string());
                pattern.push_str("(.+)");
            } else {
                Self::check_variable_name(expr, expr)?;
                variables.push(expr.to_string());
                pattern.push_str("([^/]+)");
            }

            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(UriTemplateError::UnbalancedBraces(template.to_string()));
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');

        let pattern = Regex::new(&pattern)
            .map_err(|_| UriTemplateError::InvalidVariable(template.to_string()))?;

        Ok(Self {
            raw: template.to_string(),
            pattern,
            variables,
            query_variables,
        })
    }

    fn check_variable_name(name: &str, expr: &str) -> Result<(), UriTemplateError> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(UriTemplateError::InvalidVariable(expr.to_string()));
        }
        Ok(())
    }

    /// The original template string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path variable names in template order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Variable names stripped from `{?...}` groups.
    pub fn query_variables(&self) -> &[String] {
        &self.query_variables
    }

    /// True when the whole input matches the template.
    pub fn matches(&self, uri: &str) -> bool {
        self.pattern.is_match(uri)
    }

    /// Match and extract variable values, or `None` on mismatch.
    pub fn extract(&self, uri: &str) -> Option<HashMap<String, String>> {
        let captures = self.pattern.captures(uri)?;
        let mut values = HashMap::with_capacity(self.variables.len());
        for (index, name) in self.variables.iter().enumerate() {
            if let Some(m) = captures.get(index + 1) {
                values.insert(name.clone(), m.as_str().to_string());
            }
        }
        Some(values)
    }
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// Identity is the template text; two templates with the same text compile
// to the same matcher.
impl PartialEq for UriTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for UriTemplate {}

impl Hash for UriTemplate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_variable() {
        let t = UriTemplate::parse("file:///notes/{name}").unwrap();
        assert!(t.matches("file:///notes/today"));
        assert!(!t.matches("file:///notes/a/b"));
        assert!(!t.matches("file:///notes/"));

        let vars = t.extract("file:///notes/today").unwrap();
        assert_eq!(vars.get("name").map(String::as_str), Some("today"));
    }

    #[test]
    fn greedy_variable_spans_segments() {
        let t = UriTemplate::parse("repo://{owner}/{path*}").unwrap();
        let vars = t.extract("repo://alice/src/main.rs").unwrap();
        assert_eq!(vars.get("owner").map(String::as_str), Some("alice"));
        assert_eq!(vars.get("path").map(String::as_str), Some("src/main.rs"));
    }

    #[test]
    fn query_group_is_stripped_but_recorded() {
        let t = UriTemplate::parse("db://{table}{?limit,offset}").unwrap();
        assert!(t.matches("db://users"));
        assert_eq!(t.query_variables(), ["limit", "offset"]);
        assert_eq!(t.variables(), ["table"]);
    }

    #[test]
    fn literal_regex_metacharacters_are_escaped() {
        let t = UriTemplate::parse("mem://a.b/{x}").unwrap();
        assert!(t.matches("mem://a.b/1"));
        assert!(!t.matches("mem://aXb/1"));
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(UriTemplate::parse("mem://{x").is_err());
        assert!(UriTemplate::parse("mem://x}").is_err());
        assert!(UriTemplate::parse("mem://{}").is_err());
        assert!(UriTemplate::parse("mem://{a b}").is_err());
    }

    #[test]
    fn identity_is_template_text() {
        let a = UriTemplate::parse("mem://{x}").unwrap();
        let b = UriTemplate::parse("mem://{x}").unwrap();
        assert_eq!(a, b);
    }
}
