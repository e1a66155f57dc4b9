use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::query::ScopeCollection;

// LIMITS

pub const MAX_TAGS_IN_CHECK: usize = 2;
// a rule block is the set of chains for one unique combination of tag names
pub const MAX_RULE_BLOCKS: usize = 10;
pub const MAX_RULES_IN_BLOCK: usize = 10;

/// Where flag records live inside a bucket.
pub const FLAGS_SCOPE: ScopeCollection<'static> = ScopeCollection {
    scope: "users",
    collection: "flags",
};

// MODELS

/// A feature flag as stored in the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub name: String,
    /// Overrides every rule block when set.
    pub default_value: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_blocks: Option<RuleBlocks>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleOp {
    Equals,
    StartsWith,
    EndsWith,
    Contains,
    // anything else a client sends; rejected when a chain is validated
    #[serde(other)]
    Unknown,
}

impl RuleOp {
    pub fn is_valid(self) -> bool {
        !matches!(self, RuleOp::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainOp {
    And,
    Or,
}

/// A single predicate over one tag. `tag.value` is the comparison value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub tag: Tag,
    pub rule_op: RuleOp,
    #[serde(default)]
    pub not: bool,
}

impl Rule {
    pub fn new(name: impl Into<String>, op: RuleOp, value: impl Into<String>) -> Self {
        Self {
            tag: Tag::new(name, value),
            rule_op: op,
            not: false,
        }
    }

    pub fn negated(mut self) -> Self {
        self.not = true;
        self
    }
}

/// One or two rules joined by a chain op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleChain {
    #[serde(rename = "PrimaryRule")]
    pub primary: Rule,
    #[serde(rename = "SecondaryRule", default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<Rule>,
    #[serde(rename = "ChainOp", default, skip_serializing_if = "Option::is_none")]
    pub chain_op: Option<ChainOp>,
}

impl RuleChain {
    pub fn single(primary: Rule) -> Self {
        Self {
            primary,
            secondary: None,
            chain_op: None,
        }
    }

    pub fn pair(primary: Rule, op: ChainOp, secondary: Rule) -> Self {
        Self {
            primary,
            secondary: Some(secondary),
            chain_op: Some(op),
        }
    }
}

/// Caller tags normalised for evaluation: sorted by name, at most two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagCheck {
    pub primary: Tag,
    pub secondary: Option<Tag>,
}

impl FlagCheck {
    /// Caller tag whose name matches `name`, ignoring case.
    pub fn tag_named(&self, name: &str) -> Option<&Tag> {
        std::iter::once(&self.primary)
            .chain(self.secondary.as_ref())
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }
}

/// Rule chains grouped by the key derived from their tag names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleBlocks(BTreeMap<String, Vec<RuleChain>>);

impl RuleBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&[RuleChain]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub(crate) fn block_mut(&mut self, key: &str) -> &mut Vec<RuleChain> {
        self.0.entry(key.to_string()).or_default()
    }
}
