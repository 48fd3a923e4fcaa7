//! Aggregation expression evaluation.

use crate::matcher::{as_f64, total_order, values_equal};
use bson::{Bson, Document};
use docmodel_core::{DriverErrorKind, Error, Result};
use std::cmp::Ordering;

/// Evaluate an expression against `doc`; missing values become `null`.
pub fn evaluate(expr: &Bson, doc: &Document, vars: &Document) -> Result<Bson> {
    Ok(evaluate_optional(expr, doc, vars)?.unwrap_or(Bson::Null))
}

/// Evaluate an expression, reporting a missing field path as `None`.
pub fn evaluate_optional(expr: &Bson, doc: &Document, vars: &Document) -> Result<Option<Bson>> {
    match expr {
        Bson::String(s) if s.starts_with("$$") => Ok(variable(&s[2..], doc, vars)),
        Bson::String(s) if s.starts_with('$') => Ok(field_value(doc, &s[1..])),
        Bson::Document(d) => match d.iter().next() {
            Some((op, arg)) if d.len() == 1 && op.starts_with('$') => operator(op, arg, doc, vars).map(Some),
            _ => {
                let mut out = Document::new();
                for (key, value) in d {
                    if let Some(v) = evaluate_optional(value, doc, vars)? {
                        out.insert(key.clone(), v);
                    }
                }
                Ok(Some(Bson::Document(out)))
            }
        },
        Bson::Array(items) => items
            .iter()
            .map(|item| evaluate(item, doc, vars))
            .collect::<Result<Vec<_>>>()
            .map(|values| Some(Bson::Array(values))),
        literal => Ok(Some(literal.clone())),
    }
}

/// Truthiness of an expression result.
pub fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Null | Bson::Undefined => false,
        Bson::Boolean(b) => *b,
        other => as_f64(other).is_none_or(|n| n != 0.0),
    }
}

/// Value at a field path, mapping across arrays.
pub fn field_value(doc: &Document, path: &str) -> Option<Bson> {
    let parts: Vec<&str> = path.split('.').collect();
    let (head, rest) = parts.split_first()?;
    doc.get(*head).and_then(|value| path_value(value, rest))
}

fn path_value(value: &Bson, parts: &[&str]) -> Option<Bson> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(value.clone());
    };
    match value {
        Bson::Document(inner) => inner.get(*head).and_then(|v| path_value(v, rest)),
        Bson::Array(items) => Some(Bson::Array(
            items.iter().filter_map(|item| path_value(item, parts)).collect(),
        )),
        _ => None,
    }
}

fn variable(reference: &str, doc: &Document, vars: &Document) -> Option<Bson> {
    let (name, path) = match reference.split_once('.') {
        Some((name, path)) => (name, Some(path)),
        None => (reference, None),
    };
    let root = if name == "ROOT" || name == "CURRENT" {
        Bson::Document(doc.clone())
    } else {
        vars.get(name)?.clone()
    };
    match (path, root) {
        (None, root) => Some(root),
        (Some(path), Bson::Document(inner)) => field_value(&inner, path),
        (Some(_), _) => None,
    }
}

fn arguments(arg: &Bson, doc: &Document, vars: &Document) -> Result<Vec<Bson>> {
    match arg {
        Bson::Array(items) => items.iter().map(|item| evaluate(item, doc, vars)).collect(),
        single => Ok(vec![evaluate(single, doc, vars)?]),
    }
}

fn pair(op: &str, arg: &Bson, doc: &Document, vars: &Document) -> Result<(Bson, Bson)> {
    let mut args = arguments(arg, doc, vars)?.into_iter();
    match (args.next(), args.next(), args.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(bad_arguments(op, "exactly two arguments")),
    }
}

fn operator(op: &str, arg: &Bson, doc: &Document, vars: &Document) -> Result<Bson> {
    let compared = |accept: fn(Ordering) -> bool| -> Result<Bson> {
        let (a, b) = pair(op, arg, doc, vars)?;
        Ok(Bson::Boolean(accept(total_order(&a, &b))))
    };
    match op {
        "$literal" => Ok(arg.clone()),
        "$cond" => {
            let (condition, then, otherwise) = match arg {
                Bson::Array(items) if items.len() == 3 => (&items[0], &items[1], &items[2]),
                Bson::Document(d) => match (d.get("if"), d.get("then"), d.get("else")) {
                    (Some(c), Some(t), Some(e)) => (c, t, e),
                    _ => return Err(bad_arguments(op, "if, then and else")),
                },
                _ => return Err(bad_arguments(op, "three arguments")),
            };
            if truthy(&evaluate(condition, doc, vars)?) {
                evaluate(then, doc, vars)
            } else {
                evaluate(otherwise, doc, vars)
            }
        }
        "$ifNull" => {
            let Bson::Array(items) = arg else {
                return Err(bad_arguments(op, "an array"));
            };
            let Some((fallback, candidates)) = items.split_last() else {
                return Err(bad_arguments(op, "at least two arguments"));
            };
            for candidate in candidates {
                match evaluate(candidate, doc, vars)? {
                    Bson::Null | Bson::Undefined => continue,
                    value => return Ok(value),
                }
            }
            evaluate(fallback, doc, vars)
        }
        "$eq" => {
            let (a, b) = pair(op, arg, doc, vars)?;
            Ok(Bson::Boolean(values_equal(&a, &b)))
        }
        "$ne" => {
            let (a, b) = pair(op, arg, doc, vars)?;
            Ok(Bson::Boolean(!values_equal(&a, &b)))
        }
        "$gt" => compared(Ordering::is_gt),
        "$gte" => compared(Ordering::is_ge),
        "$lt" => compared(Ordering::is_lt),
        "$lte" => compared(Ordering::is_le),
        "$in" => {
            let (needle, haystack) = pair(op, arg, doc, vars)?;
            let Bson::Array(items) = haystack else {
                return Err(bad_arguments(op, "an array as its second argument"));
            };
            Ok(Bson::Boolean(items.iter().any(|item| values_equal(item, &needle))))
        }
        "$and" => Ok(Bson::Boolean(arguments(arg, doc, vars)?.iter().all(truthy))),
        "$or" => Ok(Bson::Boolean(arguments(arg, doc, vars)?.iter().any(truthy))),
        "$not" => {
            let args = arguments(arg, doc, vars)?;
            Ok(Bson::Boolean(!args.first().is_some_and(truthy)))
        }
        "$size" => match arguments(arg, doc, vars)?.as_slice() {
            [Bson::Array(items)] => Ok(Bson::Int32(i32::try_from(items.len()).unwrap_or(i32::MAX))),
            _ => Err(bad_arguments(op, "an array")),
        },
        "$concat" => {
            let mut out = String::new();
            for value in arguments(arg, doc, vars)? {
                match value {
                    Bson::String(s) => out.push_str(&s),
                    Bson::Null => return Ok(Bson::Null),
                    _ => return Err(bad_arguments(op, "strings")),
                }
            }
            Ok(Bson::String(out))
        }
        other => Err(Error::driver(
            DriverErrorKind::Command,
            format!("unsupported expression operator: {other}"),
        )),
    }
}

fn bad_arguments(op: &str, expected: &str) -> Error {
    Error::driver(DriverErrorKind::Command, format!("{op} takes {expected}"))
}
