use serde::Serialize;

use crate::error::FlagError;
use crate::flags::{
    ChainOp, FlagCheck, Record, Rule, RuleBlocks, RuleChain, RuleOp, Tag, MAX_RULES_IN_BLOCK,
    MAX_RULE_BLOCKS, MAX_TAGS_IN_CHECK,
};

// Flag evaluation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlagEvaluation {
    pub enabled: bool,
    pub reason: String,
}

impl FlagEvaluation {
    fn new(enabled: bool, reason: impl Into<String>) -> Self {
        Self {
            enabled,
            reason: reason.into(),
        }
    }
}

// KEYS

fn block_key(first: &str, second: Option<&str>) -> String {
    let first = first.to_lowercase();
    match second {
        None => first,
        Some(second) => {
            let second = second.to_lowercase();
            if first <= second {
                format!("{}+{}", first, second)
            } else {
                format!("{}+{}", second, first)
            }
        }
    }
}

/// Key of the rule block a chain belongs to. Depends only on the set of tag
/// names, so swapping primary and secondary yields the same key.
pub fn rule_block_key(chain: &RuleChain) -> String {
    block_key(
        &chain.primary.tag.name,
        chain.secondary.as_ref().map(|r| r.tag.name.as_str()),
    )
}

/// Key of the rule block a check is evaluated against.
pub fn flag_check_key(check: &FlagCheck) -> String {
    block_key(
        &check.primary.name,
        check
            .secondary
            .as_ref()
            .map(|t| t.name.as_str())
            .filter(|n| !n.is_empty()),
    )
}

// VALIDATION & MERGE

/// Check that `chain` is well formed and that `blocks` has room for it.
pub fn validate_new_rule_chain(blocks: &RuleBlocks, chain: &RuleChain) -> Result<(), FlagError> {
    let rules = || std::iter::once(&chain.primary).chain(chain.secondary.as_ref());

    if rules().any(|r| r.tag.name.is_empty()) {
        return Err(FlagError::Validation(
            "unable to process new rule chain due to empty tag(s)".to_string(),
        ));
    }

    if rules().any(|r| r.tag.value.is_empty()) {
        return Err(FlagError::Validation(
            "unable to process new rule chain due to empty tag value(s)".to_string(),
        ));
    }

    if rules().any(|r| !r.rule_op.is_valid()) {
        return Err(FlagError::Validation(
            "unable to process new rule chain due to invalid rule op(s)".to_string(),
        ));
    }

    if let Some(secondary) = &chain.secondary {
        if chain.chain_op.is_none() {
            return Err(FlagError::Validation(
                "unable to process new rule chain due to missing chain op".to_string(),
            ));
        }
        // a check carries one value per tag name, so such a pair could never be looked up
        if secondary.tag.name.eq_ignore_ascii_case(&chain.primary.tag.name) {
            return Err(FlagError::Validation(format!(
                "unable to process new rule chain, both rules use tag {:?}",
                secondary.tag.name
            )));
        }
    }

    let key = rule_block_key(chain);
    match blocks.get(&key) {
        None if blocks.len() >= MAX_RULE_BLOCKS => Err(FlagError::Validation(format!(
            "unable to process new rule chain due to too many rule blocks: {}",
            MAX_RULE_BLOCKS
        ))),
        Some(chains) if chains.len() >= MAX_RULES_IN_BLOCK => Err(FlagError::Validation(format!(
            "unable to process new rule chain due to too many rules in block {:?}: {}",
            key,
            chains.len()
        ))),
        _ => Ok(()),
    }
}

/// Validate `chain` and append it to its block. Returns the block key.
pub fn process_new_rule_chain(blocks: &mut RuleBlocks, chain: RuleChain) -> Result<String, FlagError> {
    validate_new_rule_chain(blocks, &chain)?;

    let key = rule_block_key(&chain);
    if let Some(existing) = blocks.get(&key).and_then(|chains| chains.iter().find(|c| **c == chain)) {
        return Err(FlagError::DuplicateChain(
            serde_json::to_string(existing).unwrap_or_else(|_| format!("{:?}", existing)),
        ));
    }

    blocks.block_mut(&key).push(chain);
    Ok(key)
}

// EVALUATION

/// Sort caller tags by name and pair them up for evaluation.
pub fn form_flag_check(tags: &[Tag]) -> Result<FlagCheck, FlagError> {
    if tags.len() > MAX_TAGS_IN_CHECK {
        return Err(FlagError::Validation(format!(
            "unable to check flag rule, too many tags: {} (max {})",
            tags.len(),
            MAX_TAGS_IN_CHECK
        )));
    }

    let mut sorted = tags.to_vec();
    sorted.sort_by_key(|t| t.name.to_lowercase());
    let mut sorted = sorted.into_iter();

    let primary = sorted.next().ok_or_else(|| {
        FlagError::Validation("unable to check flag rule, no tags given".to_string())
    })?;

    Ok(FlagCheck {
        primary,
        secondary: sorted.next(),
    })
}

/// Evaluate caller tags against the stored rule blocks.
pub fn check_blocks(blocks: &RuleBlocks, tags: &[Tag]) -> Result<bool, FlagError> {
    explain_blocks(blocks, tags).map(|e| e.enabled)
}

fn explain_blocks(blocks: &RuleBlocks, tags: &[Tag]) -> Result<FlagEvaluation, FlagError> {
    let check = form_flag_check(tags)?;
    let key = flag_check_key(&check);

    let chains = match blocks.get(&key) {
        Some(chains) => chains,
        None => {
            return Ok(FlagEvaluation::new(
                false,
                format!("No rule block for tags: {}", key),
            ))
        }
    };

    // first chain that holds wins
    for (i, chain) in chains.iter().enumerate() {
        if check_rule_chain(chain, &check)? {
            return Ok(FlagEvaluation::new(
                true,
                format!("Matched rule chain {} in block: {}", i, key),
            ));
        }
    }

    Ok(FlagEvaluation::new(
        false,
        format!("No rule chain matched in block: {}", key),
    ))
}

fn check_rule_chain(chain: &RuleChain, check: &FlagCheck) -> Result<bool, FlagError> {
    let left = check_rule(&chain.primary, check)?;

    let secondary = match &chain.secondary {
        Some(secondary) => secondary,
        None => return Ok(left),
    };

    match chain.chain_op {
        Some(ChainOp::Or) if left => Ok(true),
        Some(ChainOp::And) if !left => Ok(false),
        Some(ChainOp::Or) | Some(ChainOp::And) => check_rule(secondary, check),
        None => Err(FlagError::CorruptRuleChain(
            "rule chain has a secondary rule but no chain op".to_string(),
        )),
    }
}

fn check_rule(rule: &Rule, check: &FlagCheck) -> Result<bool, FlagError> {
    // the block key guarantees a tag of this name is present
    let tag = match check.tag_named(&rule.tag.name) {
        Some(tag) => tag,
        None => return Ok(false),
    };

    let expected = rule.tag.value.as_str();
    let actual = tag.value.as_str();
    let test = match rule.rule_op {
        RuleOp::Equals => actual == expected,
        RuleOp::StartsWith => actual.starts_with(expected),
        RuleOp::EndsWith => actual.ends_with(expected),
        RuleOp::Contains => actual.contains(expected),
        RuleOp::Unknown => {
            return Err(FlagError::CorruptRuleChain(format!(
                "unable to form rule check for tag {:?}",
                rule.tag.name
            )))
        }
    };

    Ok(test != rule.not)
}

/// Evaluate if a flag is on for the given caller tags.
///
/// The default value overrides targeting: a flag whose default is set is on
/// without consulting its rule blocks.
pub fn evaluate_flag(record: &Record, tags: &[Tag]) -> Result<FlagEvaluation, FlagError> {
    if record.default_value {
        return Ok(FlagEvaluation::new(true, "Default value is set"));
    }

    form_flag_check(tags)?;

    match &record.rule_blocks {
        Some(blocks) => explain_blocks(blocks, tags),
        None => Ok(FlagEvaluation::new(false, "Flag has no rule blocks")),
    }
}
