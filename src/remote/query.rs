//! Filters and ordering for collection queries.
//!
//! The same definitions are sent to the remote store and evaluated locally
//! against cached documents, so both sides agree on what a query returns.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::document::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOp {
  Eq,
  NotEq,
  Lt,
  Lte,
  Gt,
  Gte,
  /// Field is an array holding the value
  ArrayContains,
}

impl FilterOp {
  fn symbol(&self) -> &'static str {
    match self {
      Self::Eq => "==",
      Self::NotEq => "!=",
      Self::Lt => "<",
      Self::Lte => "<=",
      Self::Gt => ">",
      Self::Gte => ">=",
      Self::ArrayContains => "contains",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
  pub field: String,
  pub op: FilterOp,
  pub value: Value,
}

impl Clause {
  /// Documents missing the field never match.
  pub fn matches(&self, doc: &Document) -> bool {
    let Some(actual) = doc.field(&self.field) else {
      return false;
    };

    let ordering = compare_values(Some(actual), Some(&self.value));
    match self.op {
      FilterOp::Eq => ordering == Ordering::Equal,
      FilterOp::NotEq => ordering != Ordering::Equal,
      FilterOp::Lt => same_rank(actual, &self.value) && ordering == Ordering::Less,
      FilterOp::Lte => same_rank(actual, &self.value) && ordering != Ordering::Greater,
      FilterOp::Gt => same_rank(actual, &self.value) && ordering == Ordering::Greater,
      FilterOp::Gte => same_rank(actual, &self.value) && ordering != Ordering::Less,
      FilterOp::ArrayContains => match actual {
        Value::Array(items) => items
          .iter()
          .any(|item| compare_values(Some(item), Some(&self.value)) == Ordering::Equal),
        _ => false,
      },
    }
  }
}

/// Conjunction of clauses over top-level fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
  clauses: Vec<Clause>,
}

impl Filter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn clause(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
    self.clauses.push(Clause {
      field: field.into(),
      op,
      value: value.into(),
    });
    self
  }

  pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.clause(field, FilterOp::Eq, value)
  }

  pub fn clauses(&self) -> &[Clause] {
    &self.clauses
  }

  pub fn is_empty(&self) -> bool {
    self.clauses.is_empty()
  }

  pub fn matches(&self, doc: &Document) -> bool {
    self.clauses.iter().all(|clause| clause.matches(doc))
  }

  pub fn describe(&self) -> String {
    self
      .clauses
      .iter()
      .map(|c| format!("{} {} {}", c.field, c.op.symbol(), c.value))
      .collect::<Vec<_>>()
      .join(" and ")
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
  pub field: String,
  #[serde(default)]
  pub descending: bool,
}

impl OrderBy {
  pub fn asc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      descending: false,
    }
  }

  pub fn desc(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
      descending: true,
    }
  }
}

/// A collection listing: optional filter, optional order (defaults to id).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
  pub filter: Option<Filter>,
  pub order: Option<OrderBy>,
}

impl ListQuery {
  pub fn all() -> Self {
    Self::default()
  }

  pub fn filtered(mut self, filter: Filter) -> Self {
    self.filter = if filter.is_empty() { None } else { Some(filter) };
    self
  }

  pub fn ordered(mut self, order: OrderBy) -> Self {
    self.order = Some(order);
    self
  }

  /// A full listing is one whose result describes the entire collection.
  pub fn is_full_listing(&self) -> bool {
    self.filter.as_ref().map_or(true, Filter::is_empty)
  }

  pub fn matches(&self, doc: &Document) -> bool {
    self.filter.as_ref().map_or(true, |f| f.matches(doc))
  }

  /// Filter and sort documents locally. Ties break on id.
  pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let mut out: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();
    out.sort_by(|a, b| {
      let primary = match &self.order {
        Some(order) => {
          let ord = compare_values(a.field(&order.field), b.field(&order.field));
          if order.descending {
            ord.reverse()
          } else {
            ord
          }
        }
        None => Ordering::Equal,
      };
      primary.then_with(|| a.id.cmp(&b.id))
    });
    out
  }
}

fn rank(value: Option<&Value>) -> u8 {
  match value {
    None => 0,
    Some(Value::Null) => 1,
    Some(Value::Bool(_)) => 2,
    Some(Value::Number(_)) => 3,
    Some(Value::String(_)) => 4,
    Some(Value::Array(_)) => 5,
    Some(Value::Object(_)) => 6,
  }
}

fn same_rank(a: &Value, b: &Value) -> bool {
  rank(Some(a)) == rank(Some(b))
}

/// Total order over JSON values: missing < null < bool < number < string <
/// array < object. Numbers compare numerically, arrays element-wise, objects
/// entry by entry in key order.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  match (a, b) {
    (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
    (Some(Value::Number(x)), Some(Value::Number(y))) => {
      let x = x.as_f64().unwrap_or(f64::NAN);
      let y = y.as_f64().unwrap_or(f64::NAN);
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
    (Some(Value::Array(x)), Some(Value::Array(y))) => x
      .iter()
      .zip(y.iter())
      .map(|(l, r)| compare_values(Some(l), Some(r)))
      .find(|ord| *ord != Ordering::Equal)
      .unwrap_or_else(|| x.len().cmp(&y.len())),
    (Some(Value::Object(x)), Some(Value::Object(y))) => {
      let mut left: Vec<(&String, &Value)> = x.iter().collect();
      let mut right: Vec<(&String, &Value)> = y.iter().collect();
      left.sort_by(|l, r| l.0.cmp(r.0));
      right.sort_by(|l, r| l.0.cmp(r.0));
      left
        .iter()
        .zip(right.iter())
        .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| compare_values(Some(lv), Some(rv))))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or_else(|| left.len().cmp(&right.len()))
    }
    _ => rank(a).cmp(&rank(b)),
  }
}
