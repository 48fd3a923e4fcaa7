//! Update operators.
//!
//! Each operator renders as `{"$op": {field: operand, ...}}`. Several
//! operators are merged into one update document by [`merge_updates`].

use docmodel_core::{Map, Value};

/// Update operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Set,
    SetOnInsert,
    Unset,
    Inc,
    Mul,
    Min,
    Max,
    Rename,
    CurrentDate,
    AddToSet,
    Push,
    Pull,
    PullAll,
    Pop,
}

impl UpdateOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            UpdateOp::Set => "$set",
            UpdateOp::SetOnInsert => "$setOnInsert",
            UpdateOp::Unset => "$unset",
            UpdateOp::Inc => "$inc",
            UpdateOp::Mul => "$mul",
            UpdateOp::Min => "$min",
            UpdateOp::Max => "$max",
            UpdateOp::Rename => "$rename",
            UpdateOp::CurrentDate => "$currentDate",
            UpdateOp::AddToSet => "$addToSet",
            UpdateOp::Push => "$push",
            UpdateOp::Pull => "$pull",
            UpdateOp::PullAll => "$pullAll",
            UpdateOp::Pop => "$pop",
        }
    }
}

/// One update operator with its field operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Op { op: UpdateOp, body: Map },
    /// Pre-built update document
    Raw(Map),
}

fn pairs<I, K, V>(items: I) -> Map
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<Value>,
{
    items
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.into()))
        .collect()
}

macro_rules! pair_ops {
    ($($(#[$doc:meta])* $name:ident => $op:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name<I, K, V>(items: I) -> Self
            where
                I: IntoIterator<Item = (K, V)>,
                K: AsRef<str>,
                V: Into<Value>,
            {
                Update::Op { op: UpdateOp::$op, body: pairs(items) }
            }
        )*
    };
}

impl Update {
    pair_ops! {
        set => Set,
        set_on_insert => SetOnInsert,
        inc => Inc,
        mul => Mul,
        min => Min,
        max => Max,
        add_to_set => AddToSet,
        push => Push,
        pull => Pull,
        pull_all => PullAll,
    }

    pub fn unset<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        Update::Op {
            op: UpdateOp::Unset,
            body: pairs(fields.into_iter().map(|f| (f, ""))),
        }
    }

    pub fn rename<I, K, N>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, N)>,
        K: AsRef<str>,
        N: Into<String>,
    {
        Update::Op {
            op: UpdateOp::Rename,
            body: pairs(fields.into_iter().map(|(k, n)| (k, n.into()))),
        }
    }

    /// Set fields to the current date.
    pub fn current_date<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        Update::Op {
            op: UpdateOp::CurrentDate,
            body: pairs(fields.into_iter().map(|f| (f, true))),
        }
    }

    /// Remove the first (`first = true`) or last array element.
    pub fn pop<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, bool)>,
        K: AsRef<str>,
    {
        Update::Op {
            op: UpdateOp::Pop,
            body: pairs(
                fields
                    .into_iter()
                    .map(|(f, first)| (f, if first { -1 } else { 1 })),
            ),
        }
    }

    pub fn render(&self) -> Map {
        match self {
            Update::Raw(map) => map.clone(),
            Update::Op { op, body } => {
                let mut out = Map::new();
                out.insert(op.as_str(), body.clone());
                out
            }
        }
    }
}

impl From<Map> for Update {
    fn from(map: Map) -> Self {
        Update::Raw(map)
    }
}

impl From<bson::Document> for Update {
    fn from(doc: bson::Document) -> Self {
        Update::Raw(doc.into_iter().map(|(k, v)| (k, Value::Bson(v))).collect())
    }
}

/// Merge update expressions into one update document.
///
/// Operator bodies with the same key merge field by field; later fields
/// win. Non-mapping bodies (pipeline-style values) replace.
pub fn merge_updates(updates: &[Update]) -> Map {
    let mut merged = Map::new();
    for update in updates {
        for (op, body) in update.render() {
            let existing = merged.get_mut(&op);
            match (existing, body) {
                (Some(Value::Map(current)), Value::Map(incoming)) => {
                    for (field, value) in incoming {
                        current.insert(field, value);
                    }
                }
                (Some(Value::Map(current)), Value::Bson(bson::Bson::Document(incoming))) => {
                    for (field, value) in incoming {
                        current.insert(field, Value::Bson(value));
                    }
                }
                (Some(slot @ Value::Bson(bson::Bson::Document(_))), incoming) => {
                    let mut current = bson_to_map(slot);
                    match incoming {
                        Value::Map(map) => {
                            for (field, value) in map {
                                current.insert(field, value);
                            }
                        }
                        Value::Bson(bson::Bson::Document(doc)) => {
                            for (field, value) in doc {
                                current.insert(field, Value::Bson(value));
                            }
                        }
                        other => {
                            *slot = other;
                            continue;
                        }
                    }
                    *slot = Value::Map(current);
                }
                (_, body) => {
                    merged.insert(op, body);
                }
            }
        }
    }
    merged
}

fn bson_to_map(value: &Value) -> Map {
    match value {
        Value::Bson(bson::Bson::Document(doc)) => doc
            .iter()
            .map(|(k, v)| (k.clone(), Value::Bson(v.clone())))
            .collect(),
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docmodel_core::Encoder;

    fn encoded(map: &Map) -> bson::Document {
        Encoder::new().encode_map(map).expect("encode")
    }

    #[test]
    fn operators_render_single_key() {
        assert_eq!(
            encoded(&Update::set([("a", 1)]).render()),
            doc! { "$set": { "a": 1 } }
        );
        assert_eq!(
            encoded(&Update::unset(["a", "b"]).render()),
            doc! { "$unset": { "a": "", "b": "" } }
        );
        assert_eq!(
            encoded(&Update::current_date(["touched"]).render()),
            doc! { "$currentDate": { "touched": true } }
        );
        assert_eq!(
            encoded(&Update::pop([("queue", true)]).render()),
            doc! { "$pop": { "queue": -1 } }
        );
        assert_eq!(
            encoded(&Update::rename([("old", "new")]).render()),
            doc! { "$rename": { "old": "new" } }
        );
    }

    #[test]
    fn set_bodies_merge_with_later_winning() {
        let merged = merge_updates(&[
            Update::set([("a", 1), ("b", 1)]),
            Update::inc([("n", 1)]),
            Update::from(doc! { "$set": { "b": 2, "c": 3 } }),
        ]);
        assert_eq!(
            encoded(&merged),
            doc! { "$set": { "a": 1, "b": 2, "c": 3 }, "$inc": { "n": 1 } }
        );
    }

    #[test]
    fn raw_first_then_typed_merge() {
        let merged = merge_updates(&[
            Update::from(doc! { "$set": { "a": 1 } }),
            Update::set([("b", 2)]),
        ]);
        assert_eq!(encoded(&merged), doc! { "$set": { "a": 1, "b": 2 } });
    }
}
