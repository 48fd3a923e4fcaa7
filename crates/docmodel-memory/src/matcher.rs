//! Query filter evaluation.
//!
//! Field conditions follow the server's matching rules: dotted paths fan
//! out across arrays, an array field matches when the array itself or any
//! of its elements satisfies the condition, and `null` matches a missing
//! field.

use crate::eval;
use bson::{Bson, Document};
use docmodel_core::{DriverErrorKind, Error, Result};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;

/// Every value reachable at a dotted path.
pub fn values_at(doc: &Document, path: &str) -> Vec<Bson> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect(doc, &parts, &mut out);
    out
}

fn collect(doc: &Document, parts: &[&str], out: &mut Vec<Bson>) {
    let Some((head, rest)) = parts.split_first() else {
        return;
    };
    if let Some(value) = doc.get(*head) {
        descend(value, rest, out);
    }
}

fn descend(value: &Bson, rest: &[&str], out: &mut Vec<Bson>) {
    let Some((head, tail)) = rest.split_first() else {
        out.push(value.clone());
        return;
    };
    match value {
        Bson::Document(inner) => collect(inner, rest, out),
        Bson::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    descend(item, tail, out);
                }
                return;
            }
            for item in items {
                if let Bson::Document(inner) = item {
                    collect(inner, rest, out);
                }
            }
        }
        _ => {}
    }
}

/// Values plus the elements of any array among them.
fn candidates(values: &[Bson]) -> Vec<&Bson> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(value);
        if let Bson::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

// ==================== Comparison ====================

pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

/// Equality with numeric widening and structural comparison.
#[allow(clippy::float_cmp)]
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x == y;
    }
    match (a, b) {
        (Bson::Document(x), Bson::Document(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb))
        }
        (Bson::Array(x), Bson::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(va, vb)| values_equal(va, vb))
        }
        _ => a == b,
    }
}

/// Ordering between values of the same type class.
pub fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 255,
        _ => 12,
    }
}

/// Total order across types, as used by sorts and `$max`/`$min`.
pub fn total_order(a: &Bson, b: &Bson) -> Ordering {
    let by_rank = type_rank(a).cmp(&type_rank(b));
    if by_rank != Ordering::Equal {
        return by_rank;
    }
    if let Some(ordering) = compare(a, b) {
        return ordering;
    }
    match (a, b) {
        (Bson::Array(x), Bson::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(va, vb)| total_order(va, vb))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Bson::Document(x), Bson::Document(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| total_order(va, vb)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => (x.time, x.increment).cmp(&(y.time, y.increment)),
        _ => Ordering::Equal,
    }
}

// ==================== Matching ====================

/// Whether `doc` satisfies `filter`.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    matches_with(doc, filter, &Document::new())
}

/// Whether `doc` satisfies `filter`, with `$$` variables for `$expr`.
pub fn matches_with(doc: &Document, filter: &Document, vars: &Document) -> Result<bool> {
    for (key, condition) in filter {
        if !matches_entry(doc, key, condition, vars)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_entry(doc: &Document, key: &str, condition: &Bson, vars: &Document) -> Result<bool> {
    match key {
        "$and" => {
            for sub in sub_filters(key, condition)? {
                if !matches_with(doc, sub, vars)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$or" => {
            for sub in sub_filters(key, condition)? {
                if matches_with(doc, sub, vars)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        "$nor" => {
            for sub in sub_filters(key, condition)? {
                if matches_with(doc, sub, vars)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$not" => match condition {
            Bson::Document(inner) => Ok(!matches_with(doc, inner, vars)?),
            _ => Err(bad_operand("$not", "a document")),
        },
        "$expr" => Ok(eval::truthy(&eval::evaluate(condition, doc, vars)?)),
        "$text" => text_search(doc, condition),
        "$comment" => Ok(true),
        other if other.starts_with('$') => Err(unknown_operator(other)),
        path => matches_field(&values_at(doc, path), condition),
    }
}

fn sub_filters<'a>(op: &str, condition: &'a Bson) -> Result<Vec<&'a Document>> {
    let Bson::Array(items) = condition else {
        return Err(bad_operand(op, "an array"));
    };
    if items.is_empty() {
        return Err(bad_operand(op, "a non-empty array"));
    }
    items
        .iter()
        .map(|item| item.as_document().ok_or_else(|| bad_operand(op, "an array of documents")))
        .collect()
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

/// Whether the values at a path satisfy a field condition.
pub fn matches_field(values: &[Bson], condition: &Bson) -> Result<bool> {
    match condition {
        Bson::Document(ops) if is_operator_document(ops) => {
            for (op, operand) in ops {
                if op == "$options" {
                    continue;
                }
                if !apply_operator(values, op, operand, ops)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Bson::RegularExpression(re) => {
            let regex = compile(&re.pattern, &re.options)?;
            Ok(regex_any(values, &regex))
        }
        other => Ok(equals_any(values, other)),
    }
}

fn equals_any(values: &[Bson], target: &Bson) -> bool {
    if matches!(target, Bson::Null) && values.is_empty() {
        return true;
    }
    candidates(values).into_iter().any(|v| values_equal(v, target))
}

fn compare_any(values: &[Bson], operand: &Bson, accept: fn(Ordering) -> bool) -> bool {
    candidates(values)
        .into_iter()
        .filter(|v| !matches!(v, Bson::Array(_)))
        .any(|v| compare(v, operand).is_some_and(accept))
}

fn apply_operator(values: &[Bson], op: &str, operand: &Bson, ops: &Document) -> Result<bool> {
    Ok(match op {
        "$eq" => equals_any(values, operand),
        "$ne" => !equals_any(values, operand),
        "$gt" => compare_any(values, operand, Ordering::is_gt),
        "$gte" => compare_any(values, operand, Ordering::is_ge),
        "$lt" => compare_any(values, operand, Ordering::is_lt),
        "$lte" => compare_any(values, operand, Ordering::is_le),
        "$in" => in_any(values, op, operand)?,
        "$nin" => !in_any(values, op, operand)?,
        "$exists" => eval::truthy(operand) == !values.is_empty(),
        "$type" => {
            let aliases: Vec<&Bson> = match operand {
                Bson::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            candidates(values)
                .into_iter()
                .any(|v| aliases.iter().any(|alias| type_matches(v, alias)))
        }
        "$regex" => {
            let options = ops.get_str("$options").unwrap_or_default();
            let regex = match operand {
                Bson::String(pattern) => compile(pattern, options)?,
                Bson::RegularExpression(re) => compile(&re.pattern, &re.options)?,
                _ => return Err(bad_operand(op, "a string or regular expression")),
            };
            regex_any(values, &regex)
        }
        "$not" => !matches_field(values, operand)?,
        "$mod" => {
            let Some([divisor, remainder]) = operand.as_array().and_then(|a| <&[Bson; 2]>::try_from(a.as_slice()).ok())
            else {
                return Err(bad_operand(op, "[divisor, remainder]"));
            };
            let (Some(divisor), Some(remainder)) = (as_f64(divisor), as_f64(remainder)) else {
                return Err(bad_operand(op, "numeric [divisor, remainder]"));
            };
            let divisor = divisor as i64;
            if divisor == 0 {
                return Err(bad_operand(op, "a non-zero divisor"));
            }
            candidates(values)
                .into_iter()
                .filter_map(as_f64)
                .any(|v| (v as i64) % divisor == remainder as i64)
        }
        "$all" => {
            let Bson::Array(required) = operand else {
                return Err(bad_operand(op, "an array"));
            };
            !required.is_empty() && required.iter().all(|r| equals_any(values, r))
        }
        "$elemMatch" => {
            let Bson::Document(condition) = operand else {
                return Err(bad_operand(op, "a document"));
            };
            let mut found = false;
            for value in values {
                let Bson::Array(items) = value else { continue };
                for item in items {
                    let hit = if is_operator_document(condition) {
                        matches_field(std::slice::from_ref(item), operand)?
                    } else {
                        match item {
                            Bson::Document(inner) => matches(inner, condition)?,
                            _ => false,
                        }
                    };
                    if hit {
                        found = true;
                        break;
                    }
                }
            }
            found
        }
        "$size" => {
            let Some(size) = as_f64(operand) else {
                return Err(bad_operand(op, "a number"));
            };
            let size = size as usize;
            values
                .iter()
                .any(|v| matches!(v, Bson::Array(items) if items.len() == size))
        }
        other => return Err(unknown_operator(other)),
    })
}

fn in_any(values: &[Bson], op: &str, operand: &Bson) -> Result<bool> {
    let Bson::Array(options) = operand else {
        return Err(bad_operand(op, "an array"));
    };
    for option in options {
        let hit = match option {
            Bson::RegularExpression(re) => regex_any(values, &compile(&re.pattern, &re.options)?),
            other => equals_any(values, other),
        };
        if hit {
            return Ok(true);
        }
    }
    Ok(false)
}

fn type_matches(value: &Bson, alias: &Bson) -> bool {
    let name = match alias {
        Bson::String(s) => s.as_str(),
        number => match as_f64(number).map(|n| n as i64) {
            Some(1) => "double",
            Some(2) => "string",
            Some(3) => "object",
            Some(4) => "array",
            Some(5) => "binData",
            Some(7) => "objectId",
            Some(8) => "bool",
            Some(9) => "date",
            Some(10) => "null",
            Some(11) => "regex",
            Some(16) => "int",
            Some(17) => "timestamp",
            Some(18) => "long",
            Some(19) => "decimal",
            _ => return false,
        },
    };
    match name {
        "number" => as_f64(value).is_some() || matches!(value, Bson::Decimal128(_)),
        "double" => matches!(value, Bson::Double(_)),
        "string" => matches!(value, Bson::String(_)),
        "object" => matches!(value, Bson::Document(_)),
        "array" => matches!(value, Bson::Array(_)),
        "binData" => matches!(value, Bson::Binary(_)),
        "objectId" => matches!(value, Bson::ObjectId(_)),
        "bool" => matches!(value, Bson::Boolean(_)),
        "date" => matches!(value, Bson::DateTime(_)),
        "null" => matches!(value, Bson::Null),
        "regex" => matches!(value, Bson::RegularExpression(_)),
        "int" => matches!(value, Bson::Int32(_)),
        "timestamp" => matches!(value, Bson::Timestamp(_)),
        "long" => matches!(value, Bson::Int64(_)),
        "decimal" => matches!(value, Bson::Decimal128(_)),
        _ => false,
    }
}

fn compile(pattern: &str, options: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| Error::driver(DriverErrorKind::Command, format!("invalid $regex: {e}")))
}

fn regex_any(values: &[Bson], regex: &Regex) -> bool {
    candidates(values)
        .into_iter()
        .any(|v| matches!(v, Bson::String(s) if regex.is_match(s)))
}

/// Word search over every string in the document.
fn text_search(doc: &Document, condition: &Bson) -> Result<bool> {
    let Some(body) = condition.as_document() else {
        return Err(bad_operand("$text", "a document"));
    };
    let search = body
        .get_str("$search")
        .map_err(|_| bad_operand("$text", "a $search string"))?;
    let case_sensitive = body.get_bool("$caseSensitive").unwrap_or(false);
    let fold = |s: &str| if case_sensitive { s.to_string() } else { s.to_lowercase() };
    let words: Vec<String> = search.split_whitespace().map(fold).collect();

    let mut strings = Vec::new();
    doc.values().for_each(|v| strings_in(v, &mut strings));
    Ok(strings
        .into_iter()
        .map(fold)
        .any(|s| words.iter().any(|w| s.contains(w.as_str()))))
}

fn strings_in<'a>(value: &'a Bson, out: &mut Vec<&'a str>) {
    match value {
        Bson::String(s) => out.push(s),
        Bson::Document(d) => d.values().for_each(|v| strings_in(v, out)),
        Bson::Array(items) => items.iter().for_each(|v| strings_in(v, out)),
        _ => {}
    }
}

fn bad_operand(op: &str, expected: &str) -> Error {
    Error::driver(DriverErrorKind::Command, format!("{op} needs {expected}"))
}

fn unknown_operator(op: &str) -> Error {
    Error::driver(DriverErrorKind::Command, format!("unknown operator: {op}"))
}
