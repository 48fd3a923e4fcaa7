//! Aggregation pipeline execution.
//!
//! Supports the stages reads and aggregations emit: `$match`, `$lookup`
//! (equality and `let`/`pipeline` forms), `$unwind`, `$set`/`$addFields`,
//! `$unset`, `$sort`, `$skip`, `$limit`, `$project`, `$count`, `$group`
//! and `$replaceRoot`.

use crate::eval::{evaluate, evaluate_optional};
use crate::matcher::{self, as_f64, total_order, values_at, values_equal};
use crate::path::{get_path, remove_path, set_path};
use bson::{Bson, Document};
use docmodel_core::{DriverErrorKind, Error, Result};
use std::cmp::Ordering;

/// Read access to other collections for `$lookup`.
pub trait CollectionSource {
    fn documents(&self, collection: &str) -> &[Document];
}

/// Run `stages` over `input`.
pub fn run(
    source: &dyn CollectionSource,
    input: Vec<Document>,
    stages: &[Document],
    vars: &Document,
) -> Result<Vec<Document>> {
    let mut docs = input;
    for stage in stages {
        let (name, spec) = match stage.iter().next() {
            Some(entry) if stage.len() == 1 => entry,
            _ => return Err(command("a pipeline stage must have exactly one field")),
        };
        docs = match name.as_str() {
            "$match" => {
                let filter = spec_document(name, spec)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matcher::matches_with(&doc, filter, vars)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$lookup" => lookup(source, docs, spec_document(name, spec)?, vars)?,
            "$unwind" => unwind(docs, spec)?,
            "$set" | "$addFields" => add_fields(docs, spec_document(name, spec)?, vars)?,
            "$unset" => {
                let paths = string_list(name, spec)?;
                docs.into_iter()
                    .map(|mut doc| {
                        for path in &paths {
                            remove_path(&mut doc, path);
                        }
                        doc
                    })
                    .collect()
            }
            "$sort" => {
                sort_documents(&mut docs, spec_document(name, spec)?);
                docs
            }
            "$skip" => {
                let n = count_operand(name, spec)?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = count_operand(name, spec)?;
                docs.truncate(n);
                docs
            }
            "$project" => {
                let projection = spec_document(name, spec)?;
                docs.iter()
                    .map(|doc| project(doc, projection, vars))
                    .collect::<Result<_>>()?
            }
            "$count" => {
                let Bson::String(field) = spec else {
                    return Err(command("$count takes a field name"));
                };
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Document::new();
                    out.insert(field.clone(), count_value(docs.len()));
                    vec![out]
                }
            }
            "$group" => group(docs, spec_document(name, spec)?, vars)?,
            "$replaceRoot" => {
                let new_root = spec_document(name, spec)?
                    .get("newRoot")
                    .ok_or_else(|| command("$replaceRoot needs newRoot"))?;
                docs.iter()
                    .map(|doc| match evaluate(new_root, doc, vars)? {
                        Bson::Document(root) => Ok(root),
                        _ => Err(command("$replaceRoot newRoot must evaluate to a document")),
                    })
                    .collect::<Result<_>>()?
            }
            other => {
                return Err(Error::driver(
                    DriverErrorKind::Command,
                    format!("unsupported pipeline stage: {other}"),
                ));
            }
        };
    }
    Ok(docs)
}

fn command(message: &str) -> Error {
    Error::driver(DriverErrorKind::Command, message)
}

fn spec_document<'a>(stage: &str, spec: &'a Bson) -> Result<&'a Document> {
    spec.as_document()
        .ok_or_else(|| Error::driver(DriverErrorKind::Command, format!("{stage} takes a document")))
}

fn string_list(stage: &str, spec: &Bson) -> Result<Vec<String>> {
    match spec {
        Bson::String(s) => Ok(vec![s.clone()]),
        Bson::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    Error::driver(DriverErrorKind::Command, format!("{stage} takes field names"))
                })
            })
            .collect(),
        _ => Err(Error::driver(DriverErrorKind::Command, format!("{stage} takes field names"))),
    }
}

fn count_operand(stage: &str, spec: &Bson) -> Result<usize> {
    as_f64(spec)
        .filter(|n| *n >= 0.0)
        .map(|n| n as usize)
        .ok_or_else(|| {
            Error::driver(DriverErrorKind::Command, format!("{stage} takes a non-negative number"))
        })
}

fn count_value(n: usize) -> Bson {
    i32::try_from(n).map_or_else(|_| Bson::Int64(n as i64), Bson::Int32)
}

fn lookup(
    source: &dyn CollectionSource,
    docs: Vec<Document>,
    spec: &Document,
    vars: &Document,
) -> Result<Vec<Document>> {
    let from = spec.get_str("from").map_err(|_| command("$lookup needs from"))?;
    let as_field = spec.get_str("as").map_err(|_| command("$lookup needs as"))?;
    let local = spec.get_str("localField").ok();
    let foreign_field = spec.get_str("foreignField").ok();
    let sub_pipeline: Vec<Document> = match spec.get("pipeline") {
        Some(Bson::Array(stages)) => stages
            .iter()
            .map(|s| s.as_document().cloned().ok_or_else(|| command("$lookup pipeline takes documents")))
            .collect::<Result<_>>()?,
        Some(_) => return Err(command("$lookup pipeline takes an array")),
        None => Vec::new(),
    };
    let let_vars = spec.get_document("let").ok();
    if local.is_some() != foreign_field.is_some() {
        return Err(command("$lookup needs both localField and foreignField"));
    }
    if local.is_none() && spec.get("pipeline").is_none() {
        return Err(command("$lookup needs localField/foreignField or a pipeline"));
    }

    let foreign = source.documents(from);
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let mut joined: Vec<Document> = match (local, foreign_field) {
            (Some(local), Some(foreign_field)) => {
                let mut keys: Vec<Bson> = Vec::new();
                for value in values_at(&doc, local) {
                    match value {
                        Bson::Array(items) => keys.extend(items),
                        other => keys.push(other),
                    }
                }
                if keys.is_empty() {
                    keys.push(Bson::Null);
                }
                let mut hits = Vec::new();
                for candidate in foreign {
                    let mut hit = false;
                    for key in &keys {
                        let condition = Bson::Document(bson::doc! { "$eq": key.clone() });
                        if matcher::matches_field(&values_at(candidate, foreign_field), &condition)? {
                            hit = true;
                            break;
                        }
                    }
                    if hit {
                        hits.push(candidate.clone());
                    }
                }
                hits
            }
            _ => foreign.to_vec(),
        };
        if !sub_pipeline.is_empty() {
            let mut scoped = vars.clone();
            if let Some(let_vars) = let_vars {
                for (name, expr) in let_vars {
                    scoped.insert(name.clone(), evaluate(expr, &doc, vars)?);
                }
            }
            joined = run(source, joined, &sub_pipeline, &scoped)?;
        }
        let joined = joined.into_iter().map(Bson::Document).collect();
        set_path(&mut doc, as_field, Bson::Array(joined))?;
        out.push(doc);
    }
    Ok(out)
}

fn unwind(docs: Vec<Document>, spec: &Bson) -> Result<Vec<Document>> {
    let (path, preserve) = match spec {
        Bson::String(path) => (path.as_str(), false),
        Bson::Document(d) => (
            d.get_str("path").map_err(|_| command("$unwind needs a path"))?,
            d.get_bool("preserveNullAndEmptyArrays").unwrap_or(false),
        ),
        _ => return Err(command("$unwind takes a path or a document")),
    };
    let field = path
        .strip_prefix('$')
        .ok_or_else(|| command("$unwind path must start with '$'"))?;

    let mut out = Vec::new();
    for mut doc in docs {
        match get_path(&doc, field).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, field, item)?;
                    out.push(copy);
                }
            }
            Some(Bson::Array(_)) => {
                if preserve {
                    remove_path(&mut doc, field);
                    out.push(doc);
                }
            }
            None | Some(Bson::Null) => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

fn add_fields(docs: Vec<Document>, spec: &Document, vars: &Document) -> Result<Vec<Document>> {
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let mut computed = Vec::with_capacity(spec.len());
        for (field, expr) in spec {
            computed.push((field, evaluate_optional(expr, &doc, vars)?));
        }
        for (field, value) in computed {
            if let Some(value) = value {
                set_path(&mut doc, field, value)?;
            }
        }
        out.push(doc);
    }
    Ok(out)
}

/// Stable sort by a `{field: 1 | -1}` specification.
pub fn sort_documents(docs: &mut [Document], spec: &Document) {
    let keys: Vec<(&str, bool)> = spec
        .iter()
        .map(|(field, direction)| (field.as_str(), as_f64(direction).is_some_and(|d| d < 0.0)))
        .collect();
    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let left = get_path(a, field).unwrap_or(&Bson::Null);
            let right = get_path(b, field).unwrap_or(&Bson::Null);
            let ordering = total_order(left, right);
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Apply a `$project` specification.
pub fn project(doc: &Document, spec: &Document, vars: &Document) -> Result<Document> {
    let is_exclusion = |value: &Bson| matches!(value, Bson::Boolean(false)) || as_f64(value) == Some(0.0);
    let excludes_only = spec.iter().all(|(_, value)| is_exclusion(value));
    if excludes_only {
        let mut out = doc.clone();
        for field in spec.keys() {
            remove_path(&mut out, field);
        }
        return Ok(out);
    }
    if spec
        .iter()
        .any(|(field, value)| field != "_id" && is_exclusion(value))
    {
        return Err(command("cannot mix inclusion and exclusion in $project"));
    }

    let mut out = Document::new();
    let keep_id = spec.get("_id").is_none_or(|v| !is_exclusion(v));
    if keep_id && !spec.contains_key("_id") {
        if let Some(id) = doc.get("_id") {
            out.insert("_id", id.clone());
        }
    }
    for (field, value) in spec {
        let included = matches!(value, Bson::Boolean(true)) || as_f64(value).is_some_and(|n| n != 0.0);
        if included {
            if let Some(found) = get_path(doc, field) {
                set_path(&mut out, field, found.clone())?;
            }
        } else if !is_exclusion(value) {
            if let Some(computed) = evaluate_optional(value, doc, vars)? {
                set_path(&mut out, field, computed)?;
            }
        }
    }
    Ok(out)
}

#[derive(Debug)]
enum Accumulator {
    Sum { total: f64, integral: bool },
    Avg { total: f64, count: u64 },
    Max(Option<Bson>),
    Min(Option<Bson>),
    First(Option<Bson>),
    Last(Option<Bson>),
    Push(Vec<Bson>),
    AddToSet(Vec<Bson>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$sum" => Accumulator::Sum { total: 0.0, integral: true },
            "$avg" => Accumulator::Avg { total: 0.0, count: 0 },
            "$max" => Accumulator::Max(None),
            "$min" => Accumulator::Min(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(None),
            "$push" => Accumulator::Push(Vec::new()),
            "$addToSet" => Accumulator::AddToSet(Vec::new()),
            other => {
                return Err(Error::driver(
                    DriverErrorKind::Command,
                    format!("unsupported accumulator: {other}"),
                ));
            }
        })
    }

    fn add(&mut self, value: Option<Bson>) {
        let present = value.clone().filter(|v| !matches!(v, Bson::Null));
        match self {
            Accumulator::Sum { total, integral } => {
                if let Some(n) = value.as_ref().and_then(as_f64) {
                    *total += n;
                    *integral &= !matches!(value, Some(Bson::Double(_)));
                }
            }
            Accumulator::Avg { total, count } => {
                if let Some(n) = value.as_ref().and_then(as_f64) {
                    *total += n;
                    *count += 1;
                }
            }
            Accumulator::Max(best) => {
                if let Some(v) = present {
                    if best.as_ref().is_none_or(|b| total_order(&v, b) == Ordering::Greater) {
                        *best = Some(v);
                    }
                }
            }
            Accumulator::Min(best) => {
                if let Some(v) = present {
                    if best.as_ref().is_none_or(|b| total_order(&v, b) == Ordering::Less) {
                        *best = Some(v);
                    }
                }
            }
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(value.unwrap_or(Bson::Null));
                }
            }
            Accumulator::Last(last) => *last = Some(value.unwrap_or(Bson::Null)),
            Accumulator::Push(items) => {
                if let Some(v) = value {
                    items.push(v);
                }
            }
            Accumulator::AddToSet(items) => {
                if let Some(v) = value {
                    if !items.iter().any(|existing| values_equal(existing, &v)) {
                        items.push(v);
                    }
                }
            }
        }
    }

    fn finish(self) -> Bson {
        match self {
            Accumulator::Sum { total, integral: true } => Bson::Int64(total as i64),
            Accumulator::Sum { total, .. } => Bson::Double(total),
            Accumulator::Avg { count: 0, .. } => Bson::Null,
            Accumulator::Avg { total, count } => Bson::Double(total / count as f64),
            Accumulator::Max(v) | Accumulator::Min(v) | Accumulator::First(v) | Accumulator::Last(v) => {
                v.unwrap_or(Bson::Null)
            }
            Accumulator::Push(items) | Accumulator::AddToSet(items) => Bson::Array(items),
        }
    }
}

fn group(docs: Vec<Document>, spec: &Document, vars: &Document) -> Result<Vec<Document>> {
    let id_expr = spec.get("_id").ok_or_else(|| command("$group needs an _id"))?;
    let mut fields: Vec<(&str, &str, &Bson)> = Vec::new();
    for (field, body) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let accumulator = body
            .as_document()
            .and_then(|d| d.iter().next().filter(|_| d.len() == 1))
            .ok_or_else(|| {
                Error::driver(
                    DriverErrorKind::Command,
                    format!("$group field '{field}' must be a single accumulator"),
                )
            })?;
        fields.push((field.as_str(), accumulator.0.as_str(), accumulator.1));
    }

    let mut groups: Vec<(Bson, Vec<Accumulator>)> = Vec::new();
    for doc in &docs {
        let key = evaluate(id_expr, doc, vars)?;
        let index = match groups.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(index) => index,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<_>>()?;
                groups.push((key, accumulators));
                groups.len() - 1
            }
        };
        for ((_, _, expr), accumulator) in fields.iter().zip(groups[index].1.iter_mut()) {
            accumulator.add(evaluate_optional(expr, doc, vars)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accumulators)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for ((field, _, _), accumulator) in fields.iter().zip(accumulators) {
                out.insert(*field, accumulator.finish());
            }
            out
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::collections::HashMap;

    struct Collections(HashMap<&'static str, Vec<Document>>);

    impl CollectionSource for Collections {
        fn documents(&self, collection: &str) -> &[Document] {
            self.0.get(collection).map(Vec::as_slice).unwrap_or_default()
        }
    }

    fn pets() -> Collections {
        let mut map = HashMap::new();
        map.insert("pets", vec![doc! { "_id": 1, "name": "rex" }, doc! { "_id": 2, "name": "tom" }]);
        Collections(map)
    }

    fn run_stages(input: Vec<Document>, stages: Vec<Document>) -> Vec<Document> {
        run(&pets(), input, &stages, &Document::new()).expect("pipeline")
    }

    #[test]
    fn single_link_join_keeps_dangling_handle() {
        let owners = vec![
            doc! { "_id": 10, "pet": { "$ref": "pets", "$id": 1 } },
            doc! { "_id": 11, "pet": { "$ref": "pets", "$id": 9 } },
        ];
        let out = run_stages(
            owners,
            vec![
                doc! { "$lookup": { "from": "pets", "localField": "pet.$id", "foreignField": "_id", "as": "_link_pet" } },
                doc! { "$unwind": { "path": "$_link_pet", "preserveNullAndEmptyArrays": true } },
                doc! { "$set": { "pet": { "$cond": {
                    "if": { "$ifNull": ["$_link_pet", false] },
                    "then": "$_link_pet",
                    "else": "$pet",
                } } } },
                doc! { "$unset": "_link_pet" },
            ],
        );
        assert_eq!(out[0], doc! { "_id": 10, "pet": { "_id": 1, "name": "rex" } });
        assert_eq!(out[1], doc! { "_id": 11, "pet": { "$ref": "pets", "$id": 9 } });
    }

    #[test]
    fn list_join_with_let_pipeline() {
        let owners = vec![doc! { "_id": 10, "pets": [{ "$ref": "pets", "$id": 2 }, { "$ref": "pets", "$id": 7 }] }];
        let out = run_stages(
            owners,
            vec![doc! { "$lookup": {
                "from": "pets",
                "let": { "link_id": "$pets.$id" },
                "pipeline": [{ "$match": { "$expr": { "$in": ["$_id", "$$link_id"] } } }],
                "as": "pets",
            } }],
        );
        assert_eq!(out[0], doc! { "_id": 10, "pets": [{ "_id": 2, "name": "tom" }] });
    }

    #[test]
    fn sort_skip_limit_project_count() {
        let input = vec![doc! { "_id": 1, "n": 3 }, doc! { "_id": 2, "n": 1 }, doc! { "_id": 3, "n": 2 }];
        let out = run_stages(
            input.clone(),
            vec![
                doc! { "$sort": { "n": -1 } },
                doc! { "$skip": 1 },
                doc! { "$limit": 1 },
                doc! { "$project": { "_id": 0, "n": 1 } },
            ],
        );
        assert_eq!(out, vec![doc! { "n": 2 }]);
        let counted = run_stages(input, vec![doc! { "$match": { "n": { "$gt": 1 } } }, doc! { "$count": "count" }]);
        assert_eq!(counted, vec![doc! { "count": 2 }]);
        assert!(run_stages(Vec::new(), vec![doc! { "$count": "count" }]).is_empty());
    }

    #[test]
    fn group_accumulators() {
        let input = vec![
            doc! { "k": "a", "v": 2_i64 },
            doc! { "k": "b", "v": 5_i64 },
            doc! { "k": "a", "v": 7_i64 },
        ];
        let out = run_stages(
            input,
            vec![doc! { "$group": {
                "_id": "$k",
                "total": { "$sum": "$v" },
                "mean": { "$avg": "$v" },
                "top": { "$max": "$v" },
                "count": { "$sum": 1 },
            } }],
        );
        assert_eq!(
            out[0],
            doc! { "_id": "a", "total": 9_i64, "mean": 4.5, "top": 7_i64, "count": 2_i64 }
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let err = run(&pets(), Vec::new(), &[doc! { "$facet": {} }], &Document::new()).expect_err("unsupported");
        assert!(err.to_string().contains("$facet"), "{err}");
    }
}
