//! Document types shared by the unit tests of this crate.

use bson::{Bson, doc, oid::ObjectId};
use docmodel_core::{
    Connection, Cx, Document, DocumentExt, DocumentSettings, FieldInfo, FieldType, Link,
    LinkedDocument, Outcome, Result, SchemaDescriptor, Value, init_documents,
};
use std::sync::OnceLock;

pub const ITEMS: &str = "q_items";

pub fn item_schema() -> &'static SchemaDescriptor {
    static S: OnceLock<SchemaDescriptor> = OnceLock::new();
    S.get_or_init(|| {
        SchemaDescriptor::document("QItem")
            .settings(DocumentSettings::new().collection(ITEMS))
            .field(FieldInfo::new("name", FieldType::Scalar("str")))
            .field(FieldInfo::new("price", FieldType::Scalar("int")))
            .field(FieldInfo::new("maker", FieldType::optional(FieldType::Link("QMaker"))))
            .build()
    })
}

pub fn maker_schema() -> &'static SchemaDescriptor {
    static S: OnceLock<SchemaDescriptor> = OnceLock::new();
    S.get_or_init(|| {
        SchemaDescriptor::document("QMaker")
            .settings(DocumentSettings::new().collection("q_makers"))
            .field(FieldInfo::new("name", FieldType::Scalar("str")))
            .build()
    })
}

pub fn register() {
    init_documents(&[item_schema(), maker_schema()]).expect("register test schemas");
}

#[derive(Debug, Clone, PartialEq)]
pub struct Maker {
    pub id: Option<Bson>,
    pub name: String,
}

impl Document for Maker {
    fn schema() -> &'static SchemaDescriptor {
        maker_schema()
    }

    fn to_fields(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.clone().into()), ("name", self.name.as_str().into())]
    }

    fn from_document(doc: &bson::Document) -> Result<Self> {
        Ok(Self {
            id: doc.get_optional("_id")?,
            name: doc.get_field("name")?,
        })
    }

    fn id(&self) -> Option<Bson> {
        self.id.clone()
    }

    fn set_id(&mut self, id: Bson) {
        self.id = Some(id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: Option<Bson>,
    pub name: String,
    pub price: i64,
    pub maker: Option<Link<Maker>>,
}

impl Item {
    pub fn new(name: &str, price: i64) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            price,
            maker: None,
        }
    }
}

impl Document for Item {
    fn schema() -> &'static SchemaDescriptor {
        item_schema()
    }

    fn to_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.clone().into()),
            ("name", self.name.as_str().into()),
            ("price", self.price.into()),
            ("maker", self.maker.as_ref().map(Link::to_value).into()),
        ]
    }

    fn from_document(doc: &bson::Document) -> Result<Self> {
        Ok(Self {
            id: doc.get_optional("_id")?,
            name: doc.get_field("name")?,
            price: doc.get_field("price")?,
            maker: doc.get_optional("maker")?,
        })
    }

    fn id(&self) -> Option<Bson> {
        self.id.clone()
    }

    fn set_id(&mut self, id: Bson) {
        self.id = Some(id);
    }

    fn linked_documents_mut(&mut self) -> Vec<&mut dyn LinkedDocument> {
        self.maker.iter_mut().filter_map(Link::linked_mut).collect()
    }
}

/// Insert `(name, price)` items directly through the driver.
pub async fn seed_items<C: Connection>(cx: &Cx, conn: &C, items: &[(&str, i64)]) {
    for (name, price) in items {
        let stored = doc! { "_id": ObjectId::new(), "name": *name, "price": *price };
        let result = conn.insert_one(cx, ITEMS, &stored, None).await;
        assert!(matches!(result, Outcome::Ok(_)), "seed insert failed");
    }
}
