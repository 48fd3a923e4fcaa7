use asupersync::runtime::RuntimeBuilder;
use bson::oid::ObjectId;

use docmodel::prelude::*;
use docmodel::{StateTracker, ValidationError, filter};
use docmodel_memory::MemoryConnection;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_error<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

const ACCOUNTS: &str = "accounts";

#[derive(Debug, Clone, PartialEq)]
struct Account {
    id: Option<Bson>,
    name: String,
    balance: i64,
    nickname: Option<String>,
    profile: bson::Document,
}

impl Account {
    fn new(name: &str, balance: i64) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            balance,
            nickname: None,
            profile: doc! { "city": "Oslo", "zip": "0150" },
        }
    }
}

impl Document for Account {
    fn schema() -> &'static SchemaDescriptor {
        static S: OnceLock<SchemaDescriptor> = OnceLock::new();
        S.get_or_init(|| {
            SchemaDescriptor::document("Account")
                .settings(
                    DocumentSettings::new()
                        .collection(ACCOUNTS)
                        .use_state_management(true)
                        .keep_nulls(false)
                        .validate_on_save(true),
                )
                .field(FieldInfo::new("name", FieldType::Scalar("str")))
                .field(FieldInfo::new("balance", FieldType::Scalar("int")))
                .field(FieldInfo::new("nickname", FieldType::optional(FieldType::Scalar("str"))))
                .field(FieldInfo::new("profile", FieldType::Scalar("dict")))
                .build()
        })
    }

    fn to_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.clone().into()),
            ("name", self.name.as_str().into()),
            ("balance", self.balance.into()),
            ("nickname", self.nickname.clone().into()),
            ("profile", self.profile.clone().into()),
        ]
    }

    fn from_document(doc: &bson::Document) -> Result<Self> {
        Ok(Self {
            id: doc.get_optional("_id")?,
            name: doc.get_field("name")?,
            balance: doc.get_field("balance")?,
            nickname: doc.get_optional("nickname")?,
            profile: doc.get_or_default("profile")?,
        })
    }

    fn id(&self) -> Option<Bson> {
        self.id.clone()
    }

    fn set_id(&mut self, id: Bson) {
        self.id = Some(id);
    }

    fn hooks() -> EventHooks<Self> {
        EventHooks::new().before(&[EventKind::Insert, EventKind::Save], |account: &mut Account| {
            account.name = account.name.to_lowercase();
            Ok(())
        })
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        if self.balance < 0 {
            errors.add("balance", "must not be negative");
        }
        errors.into_result()
    }
}

fn register() {
    init_documents(&[Account::schema()]).expect("register schemas");
}

fn stored(conn: &MemoryConnection, id: &Bson) -> bson::Document {
    conn.documents(ACCOUNTS)
        .into_iter()
        .find(|d| d.get("_id") == Some(id))
        .expect("stored account")
}

#[test]
fn save_changes_without_changes_issues_no_write() {
    register();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut account = TrackedDocument::new(Account::new("Alice", 10));
        unwrap_outcome(account.insert(&cx, &conn, WriteRules::DoNothing, None).await);
        let id = account.id().expect("assigned id");
        assert!(!account.is_changed().expect("tracked"));

        // Changed behind the instance's back; a write would overwrite it.
        unwrap_outcome(
            conn.update_one(&cx, ACCOUNTS, &doc! { "_id": id.clone() }, &doc! { "$set": { "balance": 99_i64 } }, false, None)
                .await,
        );
        unwrap_outcome(account.save_changes(&cx, &conn, false).await);
        assert_eq!(stored(&conn, &id).get_i64("balance").expect("balance"), 99);
    });
}

#[test]
fn save_changes_writes_only_the_diff() {
    register();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut account = TrackedDocument::new(Account::new("bob", 5));
        account.nickname = Some("bobby".to_string());
        unwrap_outcome(account.insert(&cx, &conn, WriteRules::DoNothing, None).await);
        let id = account.id().expect("assigned id");

        unwrap_outcome(
            conn.update_one(&cx, ACCOUNTS, &doc! { "_id": id.clone() }, &doc! { "$set": { "name": "robert" } }, false, None)
                .await,
        );
        account.balance = 7;
        account.nickname = None;
        account.profile.insert("city", "Bergen");
        assert_eq!(
            account.get_changes().expect("changes"),
            doc! { "balance": 7_i64, "nickname": Bson::Null, "profile.city": "Bergen" }
        );
        unwrap_outcome(account.save_changes(&cx, &conn, false).await);

        let after = stored(&conn, &id);
        assert_eq!(after.get_str("name").expect("name"), "robert");
        assert_eq!(after.get_i64("balance").expect("balance"), 7);
        assert!(!after.contains_key("nickname"), "null field should be unset: {after}");
        assert_eq!(after.get_document("profile").expect("profile"), &doc! { "city": "Bergen", "zip": "0150" });
        assert!(account.get_changes().expect("changes").is_empty());
    });
}

#[test]
fn rollback_restores_saved_state() {
    register();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut account = TrackedDocument::new(Account::new("carol", 1));
        unwrap_outcome(account.insert(&cx, &conn, WriteRules::DoNothing, None).await);
        let original = account.inner().clone();

        account.name = "mallory".to_string();
        account.balance = 1_000;
        assert!(account.is_changed().expect("tracked"));
        account.rollback().expect("rollback");
        assert_eq!(account.inner(), &original);
        assert!(!account.is_changed().expect("tracked"));
    });
}

#[test]
fn hooks_and_validation_run_on_writes() {
    register();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut shouting = TrackedDocument::new(Account::new("DAVE", 0));
        unwrap_outcome(shouting.insert(&cx, &conn, WriteRules::DoNothing, None).await);
        let id = shouting.id().expect("assigned id");
        assert_eq!(stored(&conn, &id).get_str("name").expect("name"), "dave");

        let mut overdrawn = TrackedDocument::new(Account::new("eve", -5));
        let err = expect_error(overdrawn.insert(&cx, &conn, WriteRules::DoNothing, None).await);
        match err {
            Error::Validation(v) => assert_eq!(v.errors.len(), 1),
            other => panic!("expected a validation error, got {other}"),
        }
        assert_eq!(conn.documents(ACCOUNTS).len(), 1);
    });
}

#[test]
fn update_shortcuts_reload_the_instance() {
    register();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut account = TrackedDocument::new(Account::new("frank", 10));
        unwrap_outcome(account.insert(&cx, &conn, WriteRules::DoNothing, None).await);

        unwrap_outcome(account.inc(&cx, &conn, [("balance", 5_i64)]).await);
        assert_eq!(account.balance, 15);
        unwrap_outcome(account.set(&cx, &conn, [("nickname", "frankie")]).await);
        assert_eq!(account.nickname.as_deref(), Some("frankie"));
        assert!(!account.is_changed().expect("tracked"));

        unwrap_outcome(account.current_date(&cx, &conn, ["touched"]).await);
        let id = account.id().expect("id");
        assert!(matches!(stored(&conn, &id).get("touched"), Some(Bson::DateTime(_))));
    });
}

#[test]
fn queries_hydrate_tracked_documents() {
    register();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let created = unwrap_outcome(
            TrackedDocument::insert_many(
                &cx,
                &conn,
                vec![Account::new("gina", 30), Account::new("hank", 5), Account::new("ivy", 20)],
                WriteRules::DoNothing,
                None,
            )
            .await,
        );
        assert_eq!(created.len(), 3);

        let rich = unwrap_outcome(
            Account::find(filter!("balance" >= 10_i64))
                .sort("-balance")
                .to_list(&cx, &conn)
                .await,
        );
        let names: Vec<&str> = rich.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["gina", "ivy"]);
        assert!(rich.iter().all(|a| !a.is_changed().expect("tracked")));

        let id = created[1].id().expect("id");
        let hank = unwrap_outcome(Account::get(id).run(&cx, &conn).await).expect("found");
        assert_eq!(hank.balance, 5);

        let total = unwrap_outcome(Account::find_all().sum(&cx, &conn, "balance").await);
        assert_eq!(total, Some(55.0));
        let name = Account::fields().get("name").expect("field");
        assert!(unwrap_outcome(Account::find(name.eq("ivy")).exists(&cx, &conn).await));
    });
}

#[test]
fn sync_replace_and_delete() {
    register();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut account = TrackedDocument::new(Account::new("jill", 3));
        unwrap_outcome(account.insert(&cx, &conn, WriteRules::DoNothing, None).await);
        let id = account.id().expect("id");

        unwrap_outcome(
            conn.update_one(&cx, ACCOUNTS, &doc! { "_id": id.clone() }, &doc! { "$set": { "balance": 40_i64 } }, false, None)
                .await,
        );
        account.name = "local".to_string();
        unwrap_outcome(account.sync(&cx, &conn).await);
        assert_eq!((account.name.as_str(), account.balance), ("jill", 40));

        account.balance = 41;
        unwrap_outcome(account.replace(&cx, &conn, WriteRules::DoNothing, false, None).await);
        assert_eq!(stored(&conn, &id).get_i64("balance").expect("balance"), 41);

        assert_eq!(unwrap_outcome(account.delete(&cx, &conn, DeleteRules::DoNothing, None).await), Some(1));
        assert!(conn.documents(ACCOUNTS).is_empty());

        let err = expect_error(account.replace(&cx, &conn, WriteRules::DoNothing, false, None).await);
        assert!(err.is_not_found(), "{err}");
        let err = expect_error(account.sync(&cx, &conn).await);
        assert!(err.is_not_found(), "{err}");
    });
}

#[test]
fn document_writes_can_be_queued_on_a_bulk_writer() {
    register();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut kept = TrackedDocument::new(Account::new("mia", 4));
        unwrap_outcome(kept.insert(&cx, &conn, WriteRules::DoNothing, None).await);
        let kept_id = kept.id().expect("id");
        let mut doomed = TrackedDocument::new(Account::new("ned", 6));
        unwrap_outcome(doomed.insert(&cx, &conn, WriteRules::DoNothing, None).await);

        let writer = BulkWriter::new();
        let mut fresh = TrackedDocument::new(Account::new("OLA", 8));
        unwrap_outcome(fresh.insert(&cx, &conn, WriteRules::DoNothing, Some(&writer)).await);
        let fresh_id = fresh.id().expect("queued insert assigns an id");
        assert_eq!(fresh.name, "ola");

        kept.balance = 5;
        unwrap_outcome(kept.replace(&cx, &conn, WriteRules::DoNothing, false, Some(&writer)).await);
        let mut saved = TrackedDocument::new(Account::new("pam", 9));
        unwrap_outcome(saved.save(&cx, &conn, WriteRules::DoNothing, false, Some(&writer)).await);
        let deleted = unwrap_outcome(doomed.delete(&cx, &conn, DeleteRules::DoNothing, Some(&writer)).await);
        assert_eq!(deleted, None);

        // Nothing reaches the collection before the commit.
        assert_eq!(writer.len(), 4);
        assert_eq!(conn.documents(ACCOUNTS).len(), 2);
        assert_eq!(stored(&conn, &kept_id).get_i64("balance").expect("balance"), 4);

        let result = unwrap_outcome(writer.commit(&cx, &conn).await);
        assert_eq!(result.inserted_count, 1);
        assert_eq!(result.deleted_count, 1);
        assert_eq!(result.upserted_ids.len(), 1);
        let mut names: Vec<String> = conn
            .documents(ACCOUNTS)
            .iter()
            .map(|d| d.get_str("name").expect("name").to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["mia", "ola", "pam"]);
        assert_eq!(stored(&conn, &kept_id).get_i64("balance").expect("balance"), 5);
        assert_eq!(stored(&conn, &fresh_id).get_i64("balance").expect("balance"), 8);
    });
}

#[test]
fn replace_many_requires_existing_documents() {
    register();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let conn = MemoryConnection::new();
        let mut accounts = unwrap_outcome(
            TrackedDocument::insert_many(
                &cx,
                &conn,
                vec![Account::new("kim", 1), Account::new("lou", 2)],
                WriteRules::DoNothing,
                None,
            )
            .await,
        );
        for account in &mut accounts {
            account.balance *= 100;
        }
        unwrap_outcome(TrackedDocument::replace_many(&cx, &conn, &mut accounts, WriteRules::DoNothing).await);
        let mut balances: Vec<i64> = conn
            .documents(ACCOUNTS)
            .iter()
            .map(|d| d.get_i64("balance").expect("balance"))
            .collect();
        balances.sort_unstable();
        assert_eq!(balances, vec![100, 200]);
        assert!(accounts.iter().all(|a| !a.is_changed().expect("tracked")));

        let mut ghost = Account::new("ghost", 0);
        ghost.id = Some(Bson::ObjectId(ObjectId::new()));
        accounts.push(TrackedDocument::new(ghost));
        let err = expect_error(TrackedDocument::replace_many(&cx, &conn, &mut accounts, WriteRules::DoNothing).await);
        assert!(err.is_not_found(), "{err}");

        let err = expect_error(TrackedDocument::replace_many(&cx, &conn, &mut accounts, WriteRules::Write).await);
        assert!(matches!(err, Error::Unsupported(_)), "{err}");
    });
}

#[test]
fn state_tracking_requires_the_policy() {
    let tracker = StateTracker::default();
    let err = tracker.is_changed(&doc! {}).expect_err("tracking is off");
    assert!(matches!(err, Error::State(_)), "{err}");
}
