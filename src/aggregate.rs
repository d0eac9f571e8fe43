//! Fan-in of per-cell replies into one caller-facing result

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Number, Value};

use crate::address::CellPath;
use crate::envelope::ResultEnvelope;
use crate::error::{CellError, Result};

/// How a set of envelopes is folded into one value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationPolicy {
    /// Exactly one envelope, returned unwrapped
    Single,
    /// Each envelope holds a list; concatenate, tagging items with their cell
    ConcatenateLists,
    /// Each envelope holds a map of numbers; sum key-wise
    SumNumericMaps,
}

/// A list item annotated with the cell that returned it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tagged<T> {
    pub cell_name: CellPath,
    pub item: T,
}

/// Result of [`aggregate`], one variant per policy
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregated {
    Single(Value),
    Tagged(Vec<Tagged<Value>>),
    Totals(BTreeMap<String, Number>),
}

/// Fold `envelopes` according to `policy`.
///
/// Failures are fail-fast in envelope order: the first failing cell fails the
/// whole result and nothing collected so far is returned.
pub fn aggregate(envelopes: Vec<ResultEnvelope>, policy: AggregationPolicy) -> Result<Aggregated> {
    match policy {
        AggregationPolicy::Single => single(envelopes).map(Aggregated::Single),
        AggregationPolicy::ConcatenateLists => concatenate_lists(envelopes).map(Aggregated::Tagged),
        AggregationPolicy::SumNumericMaps => sum_numeric_maps(envelopes).map(Aggregated::Totals),
    }
}

/// The single targeted reply
pub fn single(envelopes: Vec<ResultEnvelope>) -> Result<Value> {
    let count = envelopes.len();
    let mut iter = envelopes.into_iter();
    match (iter.next(), iter.next()) {
        (Some(envelope), None) => envelope.unwrap(),
        _ => Err(CellError::ProtocolViolation(format!(
            "expected exactly one response, got {count}"
        ))),
    }
}

/// Concatenate per-cell lists, preserving envelope order then item order
pub fn concatenate_lists(envelopes: Vec<ResultEnvelope>) -> Result<Vec<Tagged<Value>>> {
    let mut out = Vec::new();
    for envelope in envelopes {
        let (cell_name, value) = envelope.unwrap_with_cell()?;
        let items = match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(CellError::ProtocolViolation(format!(
                    "cell {cell_name} returned {} where a list was expected",
                    kind_of(&other)
                )));
            }
        };
        out.extend(items.into_iter().map(|item| Tagged {
            cell_name: cell_name.clone(),
            item,
        }));
    }
    Ok(out)
}

/// Sum per-cell numeric maps; a key missing from one cell counts as zero
pub fn sum_numeric_maps(envelopes: Vec<ResultEnvelope>) -> Result<BTreeMap<String, Number>> {
    let mut totals: BTreeMap<String, Number> = BTreeMap::new();
    for envelope in envelopes {
        let (cell_name, value) = envelope.unwrap_with_cell()?;
        let map = match value {
            Value::Object(map) => map,
            Value::Null => continue,
            other => {
                return Err(CellError::ProtocolViolation(format!(
                    "cell {cell_name} returned {} where a map was expected",
                    kind_of(&other)
                )));
            }
        };
        for (key, val) in map {
            let Value::Number(n) = val else {
                return Err(CellError::ProtocolViolation(format!(
                    "cell {cell_name} returned {} for '{key}' where a number was expected",
                    kind_of(&val)
                )));
            };
            let sum = match totals.get(&key) {
                Some(current) => add_numbers(current, &n).ok_or_else(|| {
                    CellError::ProtocolViolation(format!("sum for '{key}' is not a finite number"))
                })?,
                None => n,
            };
            totals.insert(key, sum);
        }
    }
    Ok(totals)
}

/// Add two JSON numbers, exactly while the sum fits an integer type and as
/// `f64` otherwise. `None` only when the float sum is not finite.
pub fn add_numbers(a: &Number, b: &Number) -> Option<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(sum.into());
        }
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(sum.into());
        }
    }
    let (x, y) = (a.as_f64()?, b.as_f64()?);
    Number::from_f64(x + y)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}
