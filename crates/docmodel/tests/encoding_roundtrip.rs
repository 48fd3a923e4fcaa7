use std::net::IpAddr;
use std::str::FromStr;

use asupersync::runtime::RuntimeBuilder;
use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use docmodel::prelude::*;
use docmodel::{CustomValue, EnumValue, Pattern};
use docmodel_memory::MemoryConnection;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Celsius(f64);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Status {
    Active,
    Retired,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Retired => "retired",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "active" => Ok(Status::Active),
            "retired" => Ok(Status::Retired),
            other => Err(Error::argument(format!("unknown status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Sensor {
    id: Option<Bson>,
    price: Decimal,
    serial: Uuid,
    firmware: Vec<u8>,
    label_filter: Pattern,
    interval: TimeDelta,
    address: IpAddr,
    installed_at: DateTime<Utc>,
    status: Status,
    threshold: Celsius,
}

impl Document for Sensor {
    fn schema() -> &'static SchemaDescriptor {
        static S: OnceLock<SchemaDescriptor> = OnceLock::new();
        S.get_or_init(|| {
            SchemaDescriptor::document("Sensor")
                .settings(DocumentSettings::new().collection("sensors"))
                .field(FieldInfo::new("price", FieldType::Scalar("decimal")))
                .field(FieldInfo::new("serial", FieldType::Scalar("uuid")))
                .field(FieldInfo::new("firmware", FieldType::Scalar("bytes")))
                .field(FieldInfo::new("label_filter", FieldType::Scalar("pattern")))
                .field(FieldInfo::new("interval", FieldType::Scalar("timedelta")))
                .field(FieldInfo::new("address", FieldType::Scalar("ip_address")))
                .field(FieldInfo::new("installed_at", FieldType::Scalar("datetime")))
                .field(FieldInfo::new("status", FieldType::Scalar("Status")))
                .field(FieldInfo::new("threshold", FieldType::Scalar("Celsius")))
                .codec("Celsius", |value: &Value| match value {
                    Value::Custom(custom) => custom
                        .downcast_ref::<Celsius>()
                        .map(|c| Bson::Double(c.0))
                        .ok_or_else(|| Error::argument("expected a Celsius value")),
                    other => Err(Error::argument(format!("expected a Celsius value, got {other:?}"))),
                })
                .build()
        })
    }

    fn to_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.clone().into()),
            ("price", self.price.into()),
            ("serial", self.serial.into()),
            ("firmware", self.firmware.clone().into()),
            ("label_filter", self.label_filter.clone().into()),
            ("interval", self.interval.into()),
            ("address", self.address.into()),
            ("installed_at", self.installed_at.into()),
            ("status", EnumValue::new("Status", self.status.as_str()).into()),
            ("threshold", Value::Custom(CustomValue::new("Celsius", self.threshold))),
        ]
    }

    fn from_document(doc: &bson::Document) -> Result<Self> {
        let status: String = doc.get_field("status")?;
        let threshold: f64 = doc.get_field("threshold")?;
        Ok(Self {
            id: doc.get_optional("_id")?,
            price: doc.get_field("price")?,
            serial: doc.get_field("serial")?,
            firmware: doc.get_field("firmware")?,
            label_filter: doc.get_field("label_filter")?,
            interval: doc.get_field("interval")?,
            address: doc.get_field("address")?,
            installed_at: doc.get_field("installed_at")?,
            status: Status::parse(&status)?,
            threshold: Celsius(threshold),
        })
    }

    fn id(&self) -> Option<Bson> {
        self.id.clone()
    }

    fn set_id(&mut self, id: Bson) {
        self.id = Some(id);
    }
}

fn sensor() -> Sensor {
    Sensor {
        id: None,
        price: Decimal::from_str("1249.95").expect("decimal"),
        serial: Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").expect("uuid"),
        firmware: vec![0xde, 0xad, 0xbe, 0xef],
        label_filter: Pattern::new("^lab-[0-9]+$", "i").expect("pattern"),
        interval: TimeDelta::milliseconds(2_500),
        address: "10.0.0.17".parse().expect("ip"),
        installed_at: DateTime::from_timestamp_millis(1_700_000_000_123).expect("timestamp"),
        status: Status::Active,
        threshold: Celsius(21.5),
    }
}

#[test]
fn values_survive_storage() {
    init_documents(&[Sensor::schema()]).expect("register schemas");
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut created = TrackedDocument::new(sensor());
        unwrap_outcome(created.insert(&cx, &conn, WriteRules::DoNothing, None).await);
        let id = created.id().expect("id");

        let stored = conn.documents("sensors").remove(0);
        assert!(matches!(stored.get("price"), Some(Bson::Decimal128(_))));
        assert!(matches!(stored.get("serial"), Some(Bson::Binary(_))));
        assert!(matches!(stored.get("label_filter"), Some(Bson::RegularExpression(_))));
        assert_eq!(stored.get_f64("interval").expect("seconds"), 2.5);
        assert_eq!(stored.get_str("address").expect("address"), "10.0.0.17");
        assert_eq!(stored.get_str("status").expect("status"), "active");
        assert_eq!(stored.get_f64("threshold").expect("threshold"), 21.5);

        let loaded = unwrap_outcome(Sensor::get(id).run(&cx, &conn).await).expect("sensor");
        assert_eq!(loaded.inner(), created.inner());
        assert_eq!(loaded.label_filter.options(), "i");
        assert!(loaded.label_filter.regex().is_match("LAB-42"));
    });
}

#[test]
fn filters_encode_their_operands() {
    init_documents(&[Sensor::schema()]).expect("register schemas");
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut cheap = sensor();
        cheap.price = Decimal::from_str("15.00").expect("decimal");
        cheap.status = Status::Retired;
        unwrap_outcome(
            TrackedDocument::insert_many(&cx, &conn, vec![sensor(), cheap], WriteRules::DoNothing, None).await,
        );

        let fields = Sensor::fields();
        let price = fields.get("price").expect("price");
        let found = unwrap_outcome(
            Sensor::find(price.eq(Decimal::from_str("1249.95").expect("decimal")))
                .to_list(&cx, &conn)
                .await,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].status, Status::Active);

        let serial = fields.get("serial").expect("serial");
        let same_serial = unwrap_outcome(Sensor::find(serial.eq(sensor().serial)).count(&cx, &conn).await);
        assert_eq!(same_serial, 2);

        let status = fields.get("status").expect("status");
        let retired = unwrap_outcome(
            Sensor::find(status.eq(EnumValue::new("Status", "retired")))
                .first_or_none(&cx, &conn)
                .await,
        )
        .expect("retired sensor");
        assert_eq!(retired.price, Decimal::from_str("15.00").expect("decimal"));
    });
}
