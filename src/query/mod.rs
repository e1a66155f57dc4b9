//! Parameterized N1QL statement building.
//!
//! Only one statement shape is supported: a partial `UPDATE` of named fields,
//! filtered by AND-chained conditions and an optional row limit. Values are
//! never written into the statement text; each one is bound to a named
//! parameter derived from its field name.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Scope and collection that, together with a bucket, address a keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeCollection<'a> {
    pub scope: &'a str,
    pub collection: &'a str,
}

/// Fully qualified keyspace name usable in a statement, e.g.
/// `` `bucket`.`users`.`flags` ``.
pub fn fully_qualified_name(bucket: &str, sc: ScopeCollection<'_>) -> String {
    format!("`{}`.`{}`.`{}`", bucket, sc.scope, sc.collection)
}

/// Single field assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub field: String,
    pub value: Value,
}

impl Update {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Is,
    IsNot,
}

impl ConditionOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ConditionOp::Eq => "=",
            ConditionOp::Neq => "!=",
            ConditionOp::Lt => "<",
            ConditionOp::Lte => "<=",
            ConditionOp::Gt => ">",
            ConditionOp::Gte => ">=",
            ConditionOp::Is => "IS",
            ConditionOp::IsNot => "IS NOT",
        }
    }
}

impl fmt::Display for ConditionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Single filter condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Where {
    pub field: String,
    pub value: Value,
    pub operation: ConditionOp,
}

impl Where {
    pub fn new(field: impl Into<String>, operation: ConditionOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            operation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub by: String,
    pub direction: Option<Direction>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("no updates given")]
    NoUpdates,

    #[error("no wheres given")]
    NoWheres,

    #[error("limit must be > 0, got {0}")]
    InvalidLimit(i64),

    #[error("invalid field name: {0:?}")]
    InvalidField(String),

    #[error("fields in the same clause map to the same parameter: {0}")]
    DuplicateParameter(String),
}

/// Statement text plus the values bound to its named parameters. Parameter
/// names are stored without the leading `$`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, Copy)]
enum ParamContext {
    Set,
    Where,
}

impl ParamContext {
    fn prefix(self) -> &'static str {
        match self {
            ParamContext::Set => "qs__",
            ParamContext::Where => "qw__",
        }
    }
}

// SET and WHERE parameters live in separate namespaces so the same field can
// appear in both clauses
fn param_name(field: &str, context: ParamContext) -> String {
    format!("{}{}", context.prefix(), field.replace('.', "_"))
}

// field names double as parameter names, so they must be dotted identifiers
fn validate_field(field: &str) -> Result<(), QueryError> {
    let starts_ok = field
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid = starts_ok
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(QueryError::InvalidField(field.to_string()));
    }
    Ok(())
}

fn bind(
    params: &mut Map<String, Value>,
    field: &str,
    value: &Value,
    context: ParamContext,
) -> Result<String, QueryError> {
    validate_field(field)?;
    let name = param_name(field, context);
    if params.contains_key(&name) {
        return Err(QueryError::DuplicateParameter(name));
    }
    params.insert(name.clone(), value.clone());
    Ok(name)
}

/// Build `UPDATE <fqn> SET ... [WHERE ...] [LIMIT n]`.
///
/// `wheres` of `None` skips the WHERE clause; `Some(&[])` is an error. Same
/// for `limit`: `None` skips the clause, a non-positive value is an error.
pub fn build_update(
    fqn: &str,
    updates: &[Update],
    wheres: Option<&[Where]>,
    limit: Option<i64>,
) -> Result<Statement, QueryError> {
    if updates.is_empty() {
        return Err(QueryError::NoUpdates);
    }

    let mut params = Map::new();
    let mut assignments = Vec::with_capacity(updates.len());
    for u in updates {
        let name = bind(&mut params, &u.field, &u.value, ParamContext::Set)?;
        assignments.push(format!("`{}` = ${}", u.field, name));
    }

    let mut text = format!("UPDATE {} SET {}", fqn, assignments.join(","));

    if let Some(wheres) = wheres {
        text.push_str(&build_where_clause(wheres, &mut params)?);
    }

    if let Some(limit) = limit {
        text.push_str(&build_limit_clause(limit)?);
    }

    Ok(Statement { text, params })
}

// only AND chaining is supported
fn build_where_clause(wheres: &[Where], params: &mut Map<String, Value>) -> Result<String, QueryError> {
    if wheres.is_empty() {
        return Err(QueryError::NoWheres);
    }

    let mut conditions = Vec::with_capacity(wheres.len());
    for w in wheres {
        let name = bind(params, &w.field, &w.value, ParamContext::Where)?;
        conditions.push(format!("`{}` {} ${}", w.field, w.operation, name));
    }

    Ok(format!(" WHERE {}", conditions.join(" AND ")))
}

fn build_limit_clause(limit: i64) -> Result<String, QueryError> {
    if limit <= 0 {
        return Err(QueryError::InvalidLimit(limit));
    }
    Ok(format!(" LIMIT {}", limit))
}

/// ` ORDER BY `field` [ASC|DESC]`. Not used by [`build_update`].
pub fn build_order_clause(order: &Order) -> Result<String, QueryError> {
    validate_field(&order.by)?;
    let mut clause = format!(" ORDER BY `{}`", order.by);
    if let Some(direction) = order.direction {
        clause.push(' ');
        clause.push_str(direction.as_str());
    }
    Ok(clause)
}
