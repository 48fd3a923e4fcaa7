//! Update operator application.

use crate::matcher::{self, as_f64, compare, values_equal};
use crate::path::{get_path, remove_path, set_path};
use bson::{Bson, DateTime, Document, Timestamp};
use docmodel_core::{DriverErrorKind, Error, Result};
use std::cmp::Ordering;

/// Whether `update` is an operator document rather than a replacement.
pub fn is_operator_update(update: &Document) -> bool {
    update.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn command(message: impl Into<String>) -> Error {
    Error::driver(DriverErrorKind::Command, message)
}

/// Apply update operators to `doc`, returning whether it changed.
///
/// `$setOnInsert` only takes effect when `inserting`.
pub fn apply(doc: &mut Document, update: &Document, inserting: bool) -> Result<bool> {
    if update.is_empty() {
        return Err(command("update document must not be empty"));
    }
    if !is_operator_update(update) {
        return Err(command("update document requires atomic operators"));
    }
    let before = doc.clone();
    for (op, body) in update {
        let body = body
            .as_document()
            .ok_or_else(|| command(format!("{op} takes a document")))?;
        for (path, operand) in body {
            apply_one(doc, op, path, operand, inserting)?;
        }
    }
    if !inserting && before.get("_id") != doc.get("_id") {
        return Err(command(
            "performing an update on the path '_id' would modify the immutable field '_id'",
        ));
    }
    Ok(*doc != before)
}

fn apply_one(doc: &mut Document, op: &str, path: &str, operand: &Bson, inserting: bool) -> Result<()> {
    match op {
        "$set" => set_path(doc, path, operand.clone()),
        "$setOnInsert" => {
            if inserting {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$unset" => {
            remove_path(doc, path);
            Ok(())
        }
        "$inc" | "$mul" => {
            let base = get_path(doc, path).cloned().unwrap_or(Bson::Int32(0));
            let next = arithmetic(op, path, &base, operand)?;
            set_path(doc, path, next)
        }
        "$min" | "$max" => {
            let replace = match get_path(doc, path) {
                None => true,
                Some(current) => {
                    let wanted = if op == "$min" { Ordering::Less } else { Ordering::Greater };
                    compare(operand, current) == Some(wanted)
                        || (compare(operand, current).is_none()
                            && matcher::total_order(operand, current) == wanted)
                }
            };
            if replace {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$rename" => {
            let target = operand
                .as_str()
                .ok_or_else(|| command("$rename target must be a string"))?;
            if let Some(value) = remove_path(doc, path) {
                set_path(doc, target, value)?;
            }
            Ok(())
        }
        "$currentDate" => {
            let wants_timestamp = operand
                .as_document()
                .and_then(|d| d.get_str("$type").ok())
                .is_some_and(|t| t == "timestamp");
            let now = DateTime::now();
            let value = if wants_timestamp {
                Bson::Timestamp(Timestamp {
                    time: u32::try_from(now.timestamp_millis() / 1000).unwrap_or(u32::MAX),
                    increment: 1,
                })
            } else {
                Bson::DateTime(now)
            };
            set_path(doc, path, value)
        }
        "$push" | "$addToSet" => {
            let items = match operand.as_document().and_then(|d| d.get("$each")) {
                Some(Bson::Array(each)) => each.clone(),
                Some(_) => return Err(command(format!("{op} $each takes an array"))),
                None => vec![operand.clone()],
            };
            let mut array = existing_array(doc, op, path)?;
            for item in items {
                if op == "$push" || !array.iter().any(|existing| values_equal(existing, &item)) {
                    array.push(item);
                }
            }
            set_path(doc, path, Bson::Array(array))
        }
        "$pull" | "$pullAll" => {
            if get_path(doc, path).is_none() {
                return Ok(());
            }
            let array = existing_array(doc, op, path)?;
            let mut kept = Vec::with_capacity(array.len());
            for item in array {
                let remove = if op == "$pullAll" {
                    let Bson::Array(values) = operand else {
                        return Err(command("$pullAll takes an array"));
                    };
                    values.iter().any(|v| values_equal(v, &item))
                } else {
                    pull_matches(&item, operand)?
                };
                if !remove {
                    kept.push(item);
                }
            }
            set_path(doc, path, Bson::Array(kept))
        }
        "$pop" => {
            if get_path(doc, path).is_none() {
                return Ok(());
            }
            let mut array = existing_array(doc, op, path)?;
            match as_f64(operand) {
                Some(n) if n < 0.0 => {
                    if !array.is_empty() {
                        array.remove(0);
                    }
                }
                Some(_) => {
                    array.pop();
                }
                None => return Err(command("$pop takes 1 or -1")),
            }
            set_path(doc, path, Bson::Array(array))
        }
        other => Err(command(format!("unknown update operator: {other}"))),
    }
}

fn existing_array(doc: &Document, op: &str, path: &str) -> Result<Vec<Bson>> {
    match get_path(doc, path) {
        None => Ok(Vec::new()),
        Some(Bson::Array(items)) => Ok(items.clone()),
        Some(_) => Err(command(format!("{op} requires '{path}' to be an array"))),
    }
}

fn pull_matches(item: &Bson, condition: &Bson) -> Result<bool> {
    match condition {
        Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')) => {
            matcher::matches_field(std::slice::from_ref(item), condition)
        }
        Bson::Document(d) => match item {
            Bson::Document(inner) => matcher::matches(inner, d),
            _ => Ok(false),
        },
        other => Ok(values_equal(item, other)),
    }
}

fn arithmetic(op: &str, path: &str, current: &Bson, operand: &Bson) -> Result<Bson> {
    let non_numeric = || command(format!("cannot apply {op} to non-numeric field '{path}'"));
    match (current, operand) {
        (Bson::Int32(a), Bson::Int32(b)) => {
            let exact = if op == "$inc" { a.checked_add(*b) } else { a.checked_mul(*b) };
            Ok(exact.map_or_else(
                || integer(op, i64::from(*a), i64::from(*b)),
                Bson::Int32,
            ))
        }
        (Bson::Int32(_) | Bson::Int64(_), Bson::Int32(_) | Bson::Int64(_)) => {
            let (Some(a), Some(b)) = (to_i64(current), to_i64(operand)) else {
                return Err(non_numeric());
            };
            Ok(integer(op, a, b))
        }
        _ => {
            let (Some(a), Some(b)) = (as_f64(current), as_f64(operand)) else {
                return Err(non_numeric());
            };
            Ok(Bson::Double(if op == "$inc" { a + b } else { a * b }))
        }
    }
}

fn to_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        _ => None,
    }
}

fn integer(op: &str, a: i64, b: i64) -> Bson {
    let result = if op == "$inc" { a.wrapping_add(b) } else { a.wrapping_mul(b) };
    Bson::Int64(result)
}

/// Seed document for an upsert: the equality fields of `filter`.
pub fn upsert_seed(filter: &Document) -> Result<Document> {
    let mut seed = Document::new();
    collect_equalities(filter, &mut seed)?;
    Ok(seed)
}

fn collect_equalities(filter: &Document, seed: &mut Document) -> Result<()> {
    for (key, value) in filter {
        if key == "$and" {
            if let Bson::Array(items) = value {
                for item in items.iter().filter_map(Bson::as_document) {
                    collect_equalities(item, seed)?;
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        match value {
            Bson::Document(ops) if ops.keys().next().is_some_and(|k| k.starts_with('$')) => {
                if let Some(eq) = ops.get("$eq") {
                    set_path(seed, key, eq.clone())?;
                }
            }
            Bson::RegularExpression(_) => {}
            other => set_path(seed, key, other.clone())?,
        }
    }
    Ok(())
}
