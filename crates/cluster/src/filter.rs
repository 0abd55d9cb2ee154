//! Node-filter expressions.
//!
//! Syntax: comma-separated matchers, a node is selected when any matcher
//! accepts it. A matcher is one of
//! - `attr:value`: node attribute `attr` equals `value`
//! - `_name:value` / `_id:value`: node name / id
//! - `value`: node name or id
//!
//! Values may carry `*` as a prefix and/or suffix wildcard. A blank
//! expression selects every node.

use std::fmt;

use crate::resolver::NodeInfo;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("empty matcher at position {0}")]
    EmptyMatcher(usize),
    #[error("matcher '{0}' has an empty attribute name")]
    EmptyAttribute(String),
    #[error("matcher '{0}' has an empty value")]
    EmptyValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        let starts = raw.starts_with('*');
        let ends = raw.len() > 1 && raw.ends_with('*');
        let inner = raw.trim_start_matches('*').trim_end_matches('*');
        match (starts, ends) {
            _ if inner.is_empty() => Pattern::Any,
            (true, true) => Pattern::Contains(inner.to_string()),
            (true, false) => Pattern::Suffix(inner.to_string()),
            (false, true) => Pattern::Prefix(inner.to_string()),
            (false, false) => Pattern::Exact(inner.to_string()),
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(v) => value == v,
            Pattern::Prefix(v) => value.starts_with(v.as_str()),
            Pattern::Suffix(v) => value.ends_with(v.as_str()),
            Pattern::Contains(v) => value.contains(v.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Attribute { key: String, pattern: Pattern },
    Name(Pattern),
    Id(Pattern),
    NameOrId(Pattern),
}

impl Matcher {
    fn matches(&self, node: &NodeInfo) -> bool {
        match self {
            Matcher::Attribute { key, pattern } => node
                .attributes
                .get(key)
                .is_some_and(|v| pattern.matches(v)),
            Matcher::Name(p) => p.matches(&node.name),
            Matcher::Id(p) => p.matches(&node.id),
            Matcher::NameOrId(p) => p.matches(&node.name) || p.matches(&node.id),
        }
    }
}

/// Parsed node-filter expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    source: String,
    matchers: Vec<Matcher>,
}

impl NodeFilter {
    /// Filter that selects every node.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse(expression: &str) -> Result<Self, FilterError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Ok(Self::all());
        }

        let mut matchers = Vec::new();
        for (i, part) in expression.split(',').enumerate() {
            let part = part.trim();
            if part.is_empty() {
                return Err(FilterError::EmptyMatcher(i));
            }
            let matcher = match part.split_once(':') {
                Some((key, value)) => {
                    let key = key.trim();
                    let value = value.trim();
                    if key.is_empty() {
                        return Err(FilterError::EmptyAttribute(part.to_string()));
                    }
                    if value.is_empty() {
                        return Err(FilterError::EmptyValue(part.to_string()));
                    }
                    let pattern = Pattern::parse(value);
                    match key {
                        "_name" => Matcher::Name(pattern),
                        "_id" => Matcher::Id(pattern),
                        _ => Matcher::Attribute {
                            key: key.to_string(),
                            pattern,
                        },
                    }
                }
                None => Matcher::NameOrId(Pattern::parse(part)),
            };
            matchers.push(matcher);
        }

        Ok(Self {
            source: expression.to_string(),
            matchers,
        })
    }

    /// Whether this filter selects every node.
    pub fn is_all(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Whether any matcher looks at node attributes.
    pub fn uses_attributes(&self) -> bool {
        self.matchers
            .iter()
            .any(|m| matches!(m, Matcher::Attribute { .. }))
    }

    pub fn matches(&self, node: &NodeInfo) -> bool {
        self.is_all() || self.matchers.iter().any(|m| m.matches(node))
    }
}

impl fmt::Display for NodeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            f.write_str("*")
        } else {
            f.write_str(&self.source)
        }
    }
}
