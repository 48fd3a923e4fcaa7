//! Filter expressions.
//!
//! Every expression renders to a single-key mapping. Field operators render
//! as `{field: {"$op": value}}`, equality as `{field: value}`, and
//! non-field operators as `{"$op": value}`. Operands stay as [`Value`]s
//! until the query is encoded, so schema codecs apply to them.

use bson::Bson;
use docmodel_core::{Error, Map, Result, Value};

/// Logical combinator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nor,
}

impl LogicalOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogicalOp::And => "$and",
            LogicalOp::Or => "$or",
            LogicalOp::Nor => "$nor",
        }
    }
}

/// Options for full-text search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextOptions {
    pub language: Option<String>,
    pub case_sensitive: bool,
    pub diacritic_sensitive: bool,
}

/// A filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Mapping used as-is
    Raw(Map),
    /// `{field: value}`
    Eq { field: String, value: Value },
    /// `{field: {"$op": operand, ...}}`
    Field { field: String, ops: Map },
    /// `{"$and" | "$or" | "$nor": [...]}`, or a collapsed single argument
    Logical { op: LogicalOp, args: Vec<Expr> },
    /// `{"$not": {field: body}}`
    Not { field: String, body: Value },
    /// `{"$text": {...}}`
    Text(Map),
    /// `{"$expr": aggregation expression}`
    Aggregation(Value),
}

fn field_op(field: impl Into<String>, op: &str, value: impl Into<Value>) -> Expr {
    let mut ops = Map::new();
    ops.insert(op, value);
    Expr::Field {
        field: field.into(),
        ops,
    }
}

impl Expr {
    // ==================== Comparison ====================

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Expr::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        field_op(field, "$ne", value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        field_op(field, "$gt", value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        field_op(field, "$gte", value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        field_op(field, "$lt", value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        field_op(field, "$lte", value)
    }

    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        field_op(field, "$in", Value::list(values))
    }

    pub fn not_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        field_op(field, "$nin", Value::list(values))
    }

    // ==================== Logical ====================

    /// AND-combine expressions. Fails on an empty list.
    pub fn and(args: Vec<Expr>) -> Result<Self> {
        Self::logical(LogicalOp::And, args)
    }

    /// OR-combine expressions. Fails on an empty list.
    pub fn or(args: Vec<Expr>) -> Result<Self> {
        Self::logical(LogicalOp::Or, args)
    }

    /// NOR-combine expressions. Never collapses; fails on an empty list.
    pub fn nor(args: Vec<Expr>) -> Result<Self> {
        Self::logical(LogicalOp::Nor, args)
    }

    fn logical(op: LogicalOp, args: Vec<Expr>) -> Result<Self> {
        if args.is_empty() {
            return Err(Error::argument(format!(
                "{} needs at least one expression",
                op.as_str()
            )));
        }
        Ok(Expr::Logical { op, args })
    }

    /// Negate a single-field expression.
    ///
    /// Bare values become `{"$eq": value}`. Operator keys and multi-key
    /// mappings are rejected.
    pub fn not(expr: impl Into<Expr>) -> Result<Self> {
        let rendered = expr.into().render();
        let Some((field, value)) = rendered.single_entry() else {
            return Err(Error::argument(
                "$not can only negate a single-field expression",
            ));
        };
        if field.starts_with('$') {
            return Err(Error::argument(format!(
                "$not cannot negate the operator '{field}'"
            )));
        }
        let body = match value {
            Value::Map(ops) if is_operator_map(ops) => value.clone(),
            Value::Bson(Bson::Document(ops))
                if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) =>
            {
                value.clone()
            }
            Value::Pattern(_) | Value::Bson(Bson::RegularExpression(_)) => value.clone(),
            other => {
                let mut eq = Map::new();
                eq.insert("$eq", other.clone());
                Value::Map(eq)
            }
        };
        Ok(Expr::Not {
            field: field.to_string(),
            body,
        })
    }

    // ==================== Element ====================

    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        field_op(field, "$exists", exists)
    }

    /// Match a BSON type by alias (`"string"`, `"int"`, ...).
    pub fn type_of(field: impl Into<String>, alias: &str) -> Self {
        field_op(field, "$type", alias)
    }

    // ==================== Evaluation ====================

    pub fn regex(field: impl Into<String>, pattern: &str, options: Option<&str>) -> Self {
        let mut ops = Map::new();
        ops.insert("$regex", pattern);
        if let Some(options) = options {
            ops.insert("$options", options);
        }
        Expr::Field {
            field: field.into(),
            ops,
        }
    }

    pub fn text(search: &str, options: &TextOptions) -> Self {
        let mut body = Map::new();
        body.insert("$search", search);
        if let Some(language) = &options.language {
            body.insert("$language", language.as_str());
        }
        body.insert("$caseSensitive", options.case_sensitive);
        body.insert("$diacriticSensitive", options.diacritic_sensitive);
        Expr::Text(body)
    }

    pub fn modulo(field: impl Into<String>, divisor: i64, remainder: i64) -> Self {
        field_op(field, "$mod", Value::list([divisor, remainder]))
    }

    /// Aggregation expression match (`$expr`).
    pub fn aggregation(expr: impl Into<Value>) -> Self {
        Expr::Aggregation(expr.into())
    }

    // ==================== Array ====================

    pub fn all<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        field_op(field, "$all", Value::list(values))
    }

    pub fn elem_match(field: impl Into<String>, expr: impl Into<Expr>) -> Self {
        field_op(field, "$elemMatch", Value::Map(expr.into().render()))
    }

    pub fn size(field: impl Into<String>, size: i64) -> Self {
        field_op(field, "$size", size)
    }

    // ==================== Rendering ====================

    /// Whether this is a compound (logical) operator.
    pub fn is_compound(&self) -> bool {
        match self {
            Expr::Logical { .. } => true,
            Expr::Raw(map) => map
                .single_entry()
                .is_some_and(|(k, _)| matches!(k, "$and" | "$or" | "$nor")),
            _ => false,
        }
    }

    /// Whether this expression contains a `$text` search at the top level.
    pub fn is_text(&self) -> bool {
        match self {
            Expr::Text(_) => true,
            Expr::Raw(map) => map.contains_key("$text"),
            _ => false,
        }
    }

    /// Render into mapping form.
    pub fn render(&self) -> Map {
        let mut out = Map::new();
        match self {
            Expr::Raw(map) => return map.clone(),
            Expr::Eq { field, value } => {
                out.insert(field.as_str(), value.clone());
            }
            Expr::Field { field, ops } => {
                out.insert(field.as_str(), ops.clone());
            }
            Expr::Logical { op, args } => {
                if let [single] = args.as_slice() {
                    let rendered = single.render();
                    let collapsible = *op != LogicalOp::Nor
                        && !single.is_compound()
                        && rendered.len() <= 1;
                    if collapsible {
                        return rendered;
                    }
                }
                let items = args.iter().map(|a| Value::Map(a.render())).collect();
                out.insert(op.as_str(), Value::List(items));
            }
            Expr::Not { field, body } => {
                let mut inner = Map::new();
                inner.insert(field.as_str(), body.clone());
                out.insert("$not", inner);
            }
            Expr::Text(body) => {
                out.insert("$text", body.clone());
            }
            Expr::Aggregation(value) => {
                out.insert("$expr", value.clone());
            }
        }
        out
    }
}

fn is_operator_map(map: &Map) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

impl From<Map> for Expr {
    fn from(map: Map) -> Self {
        Expr::Raw(map)
    }
}

impl From<bson::Document> for Expr {
    fn from(doc: bson::Document) -> Self {
        Expr::Raw(doc.into_iter().map(|(k, v)| (k, Value::Bson(v))).collect())
    }
}

/// AND-combine rendered expressions into one mapping.
///
/// An empty list renders as an empty filter; a single expression renders
/// bare.
pub fn combine(exprs: &[Expr]) -> Map {
    match exprs {
        [] => Map::new(),
        [single] => single.render(),
        many => {
            let mut out = Map::new();
            out.insert(
                "$and",
                Value::List(many.iter().map(|e| Value::Map(e.render())).collect()),
            );
            out
        }
    }
}
