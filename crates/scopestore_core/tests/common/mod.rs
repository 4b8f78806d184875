#![allow(dead_code)]

use rusqlite::ffi;
use scopestore_core::db::open_db;
use scopestore_core::model::Discriminator;
use scopestore_core::store::PendingWrite;
use scopestore_core::{
    record, shared, ChangeEvent, ConnectionInfo, ContextOptions, Entity, EntityId, EntityModel,
    EntityNode, ExtendedUseSession, ModelResult, Navigation, NotificationSink, PersistenceContext,
    Record, RetryPolicy, Session, SharedSession, SingleUseSession, SqliteStore, StoreBackend,
    StoreError, StoreResult, Value, WriteScopeRegistry, UNSAVED_ID,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const SCHEMA: &str = "
CREATE TABLE products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer TEXT NOT NULL
);
CREATE TABLE order_lines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id INTEGER NOT NULL REFERENCES orders(id),
    product_id INTEGER REFERENCES products(id),
    quantity INTEGER NOT NULL
);
CREATE TABLE invoices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    number TEXT NOT NULL,
    deleted_at INTEGER
);
CREATE TABLE animals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL
);
CREATE TABLE toys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL REFERENCES animals(id),
    label TEXT NOT NULL
);
CREATE TABLE payments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    amount INTEGER NOT NULL
);
CREATE TABLE receipts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payment_id INTEGER NOT NULL REFERENCES payments(id)
);
CREATE TABLE categories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER REFERENCES categories(id),
    name TEXT NOT NULL
);
";

pub fn product_model() -> &'static EntityModel {
    &PRODUCT
}
pub fn order_model() -> &'static EntityModel {
    &ORDER
}
pub fn line_model() -> &'static EntityModel {
    &ORDER_LINE
}
pub fn invoice_model() -> &'static EntityModel {
    &INVOICE
}
pub fn animal_model() -> &'static EntityModel {
    &ANIMAL
}
pub fn dog_model() -> &'static EntityModel {
    &DOG
}
pub fn toy_model() -> &'static EntityModel {
    &TOY
}
pub fn payment_model() -> &'static EntityModel {
    &PAYMENT
}
pub fn receipt_model() -> &'static EntityModel {
    &RECEIPT
}
pub fn category_model() -> &'static EntityModel {
    &CATEGORY
}

const ORDER_NAVS: &[Navigation] = &[Navigation::many("Lines", line_model, "order_id").eager()];
const LINE_NAVS: &[Navigation] =
    &[Navigation::one("Product", product_model, "product_id").eager()];
const DOG_NAVS: &[Navigation] = &[Navigation::many("Toys", toy_model, "owner_id").eager()];
// Collection declared as a single reference: the foreign key lives on receipts.
const PAYMENT_NAVS: &[Navigation] = &[Navigation::one("Receipts", receipt_model, "payment_id")];
const CATEGORY_NAVS: &[Navigation] = &[
    Navigation::one("Parent", category_model, "parent_id"),
    Navigation::many("Children", category_model, "parent_id").eager(),
];

static PRODUCT: EntityModel = EntityModel::new("Product", "products", &["name"]);
static ORDER: EntityModel =
    EntityModel::new("Order", "orders", &["customer"]).with_navigations(ORDER_NAVS);
static ORDER_LINE: EntityModel =
    EntityModel::new("OrderLine", "order_lines", &["order_id", "product_id", "quantity"])
        .with_navigations(LINE_NAVS);
static INVOICE: EntityModel =
    EntityModel::new("Invoice", "invoices", &["number", "deleted_at"]).soft_delete("deleted_at");
static ANIMAL: EntityModel = EntityModel::new("Animal", "animals", &["name", "kind"]);
static DOG: EntityModel = EntityModel::new("Dog", "animals", &["name", "kind"])
    .derived_from(animal_model, "kind", "dog")
    .with_navigations(DOG_NAVS);
static TOY: EntityModel = EntityModel::new("Toy", "toys", &["owner_id", "label"]);
static PAYMENT: EntityModel =
    EntityModel::new("Payment", "payments", &["amount"]).with_navigations(PAYMENT_NAVS);
static RECEIPT: EntityModel = EntityModel::new("Receipt", "receipts", &["payment_id"]);
static GHOST: EntityModel = EntityModel::new("Ghost", "ghosts", &[]);
static CATEGORY: EntityModel =
    EntityModel::new("Category", "categories", &["parent_id", "name"])
        .with_navigations(CATEGORY_NAVS);

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn optional_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: EntityId,
    pub name: String,
}

impl Product {
    pub fn new(name: &str) -> Self {
        Self {
            id: UNSAVED_ID,
            name: name.to_string(),
        }
    }

    pub fn with_id(id: EntityId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

impl Entity for Product {
    fn model() -> &'static EntityModel {
        &PRODUCT
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        record([("name", text(&self.name))])
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self {
            id: node.id,
            name: node.text("name")?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("product name is empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderLine {
    pub id: EntityId,
    pub order_id: EntityId,
    pub product_id: Option<EntityId>,
    pub quantity: i64,
    pub product: Option<Product>,
}

impl Entity for OrderLine {
    fn model() -> &'static EntityModel {
        &ORDER_LINE
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        record([
            ("order_id", Value::Integer(self.order_id)),
            ("product_id", optional_integer(self.product_id)),
            ("quantity", Value::Integer(self.quantity)),
        ])
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self {
            id: node.id,
            order_id: node.integer("order_id")?,
            product_id: node.optional_integer("product_id")?,
            quantity: node.integer("quantity")?,
            product: node.one("Product").map(Product::from_node).transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: EntityId,
    pub customer: String,
    pub lines: Vec<OrderLine>,
}

impl Order {
    pub fn new(customer: &str) -> Self {
        Self {
            id: UNSAVED_ID,
            customer: customer.to_string(),
            lines: Vec::new(),
        }
    }
}

impl Entity for Order {
    fn model() -> &'static EntityModel {
        &ORDER
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        record([("customer", text(&self.customer))])
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self {
            id: node.id,
            customer: node.text("customer")?,
            lines: node
                .many("Lines")
                .iter()
                .map(OrderLine::from_node)
                .collect::<ModelResult<Vec<_>>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub id: EntityId,
    pub number: String,
    pub deleted_at: Option<i64>,
}

impl Entity for Invoice {
    fn model() -> &'static EntityModel {
        &INVOICE
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        record([
            ("number", text(&self.number)),
            ("deleted_at", optional_integer(self.deleted_at)),
        ])
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self {
            id: node.id,
            number: node.text("number")?,
            deleted_at: node.optional_integer("deleted_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Animal {
    pub id: EntityId,
    pub name: String,
    pub kind: String,
}

impl Entity for Animal {
    fn model() -> &'static EntityModel {
        &ANIMAL
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        record([("name", text(&self.name)), ("kind", text(&self.kind))])
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self {
            id: node.id,
            name: node.text("name")?,
            kind: node.text("kind")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Toy {
    pub id: EntityId,
    pub owner_id: EntityId,
    pub label: String,
}

impl Entity for Toy {
    fn model() -> &'static EntityModel {
        &TOY
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        record([
            ("owner_id", Value::Integer(self.owner_id)),
            ("label", text(&self.label)),
        ])
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self {
            id: node.id,
            owner_id: node.integer("owner_id")?,
            label: node.text("label")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dog {
    pub id: EntityId,
    pub name: String,
    pub toys: Vec<Toy>,
}

impl Entity for Dog {
    fn model() -> &'static EntityModel {
        &DOG
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        record([("name", text(&self.name)), ("kind", text("dog"))])
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self {
            id: node.id,
            name: node.text("name")?,
            toys: node
                .many("Toys")
                .iter()
                .map(Toy::from_node)
                .collect::<ModelResult<Vec<_>>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Payment {
    pub id: EntityId,
    pub amount: i64,
}

impl Entity for Payment {
    fn model() -> &'static EntityModel {
        &PAYMENT
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        record([("amount", Value::Integer(self.amount))])
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self {
            id: node.id,
            amount: node.integer("amount")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ghost {
    pub id: EntityId,
}

impl Entity for Ghost {
    fn model() -> &'static EntityModel {
        &GHOST
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        Record::new()
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self { id: node.id })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: EntityId,
    pub parent_id: Option<EntityId>,
    pub name: String,
    pub children: Vec<Category>,
}

impl Entity for Category {
    fn model() -> &'static EntityModel {
        &CATEGORY
    }

    fn id(&self) -> EntityId {
        self.id
    }

    fn to_record(&self) -> Record {
        record([
            ("parent_id", optional_integer(self.parent_id)),
            ("name", text(&self.name)),
        ])
    }

    fn from_node(node: &EntityNode) -> ModelResult<Self> {
        Ok(Self {
            id: node.id,
            parent_id: node.optional_integer("parent_id")?,
            name: node.text("name")?,
            children: node
                .many("Children")
                .iter()
                .map(Category::from_node)
                .collect::<ModelResult<Vec<_>>>()?,
        })
    }
}

/// Counters shared by every backend a fixture hands out.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    applies: Arc<AtomicUsize>,
    loads: Arc<AtomicUsize>,
    busy_failures: Arc<AtomicUsize>,
}

impl Counters {
    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    /// Single-row and foreign-key reads that reached the database.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Makes the next `count` batches fail with `SQLITE_BUSY`.
    pub fn fail_busy(&self, count: usize) {
        self.busy_failures.store(count, Ordering::SeqCst);
    }
}

/// SQLite backend that counts reads and batch writes and can fake lock contention.
pub struct CountingBackend {
    inner: SqliteStore,
    counters: Counters,
}

impl StoreBackend for CountingBackend {
    fn describe(&self) -> String {
        format!("counting:{}", self.inner.describe())
    }

    fn has_set(&self, model: &EntityModel) -> StoreResult<bool> {
        self.inner.has_set(model)
    }

    fn check_record(&self, model: &'static EntityModel, record: &Record) -> StoreResult<()> {
        self.inner.check_record(model, record)
    }

    fn fetch(&self, model: &EntityModel, id: EntityId) -> StoreResult<Option<Record>> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(model, id)
    }

    fn fetch_where(
        &self,
        model: &EntityModel,
        column: &str,
        value: &Value,
    ) -> StoreResult<Vec<(EntityId, Record)>> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_where(model, column, value)
    }

    fn fetch_all(
        &self,
        model: &EntityModel,
        filter: Option<&Discriminator>,
    ) -> StoreResult<Vec<(EntityId, Record)>> {
        self.inner.fetch_all(model, filter)
    }

    fn apply(&mut self, writes: &[PendingWrite<'_>]) -> StoreResult<Vec<EntityId>> {
        self.counters.applies.fetch_add(1, Ordering::SeqCst);
        let busy = self
            .counters
            .busy_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if busy {
            return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                ffi::Error::new(ffi::SQLITE_BUSY),
                None,
            )));
        }
        self.inner.apply(writes)
    }
}

/// Sink that keeps every event it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(ChangeEvent::name).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn publish(&self, event: ChangeEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// File database with the test schema, plus an isolated scope registry.
pub struct Fixture {
    _dir: TempDir,
    pub info: ConnectionInfo,
    pub registry: Arc<WriteScopeRegistry>,
    pub counters: Counters,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let conn = open_db(&path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        Self {
            _dir: dir,
            info: ConnectionInfo::new(path.to_string_lossy()),
            registry: Arc::new(WriteScopeRegistry::new()),
            counters: Counters::default(),
        }
    }

    pub fn session(&self) -> Session {
        Session::new(CountingBackend {
            inner: SqliteStore::open(&self.info).unwrap(),
            counters: self.counters.clone(),
        })
    }

    pub fn single_use(&self) -> SharedSession {
        shared(SingleUseSession::new(self.session()))
    }

    pub fn extended(&self) -> SharedSession {
        self.extended_with_budget(usize::MAX)
    }

    /// Extended-use handle whose provider fails once `sessions` have been opened.
    pub fn extended_with_budget(&self, sessions: usize) -> SharedSession {
        let info = self.info.clone();
        let counters = self.counters.clone();
        let mut left = sessions;
        shared(ExtendedUseSession::new(move || {
            if left == 0 {
                return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                    ffi::Error::new(ffi::SQLITE_CANTOPEN),
                    None,
                )));
            }
            left -= 1;
            Ok(Session::new(CountingBackend {
                inner: SqliteStore::open(&info)?,
                counters: counters.clone(),
            }))
        }))
    }

    /// Context over `handle` with fast retries.
    pub fn context<T: Entity>(&self, handle: SharedSession) -> PersistenceContext<T> {
        PersistenceContext::new(handle, Arc::clone(&self.registry))
            .unwrap()
            .with_options(ContextOptions {
                retry: RetryPolicy {
                    max_retries: 3,
                    delay_ms: 1,
                },
            })
    }

    /// Context over a fresh single-use session.
    pub fn fresh<T: Entity>(&self) -> PersistenceContext<T> {
        self.context(self.single_use())
    }

    pub fn applies(&self) -> usize {
        self.counters.applies()
    }

    pub fn loads(&self) -> usize {
        self.counters.loads()
    }

    pub fn exec(&self, sql: &str) {
        open_db(self.info.path()).unwrap().execute_batch(sql).unwrap();
    }

    pub fn count(&self, table: &str) -> i64 {
        self.scalar(&format!("SELECT COUNT(*) FROM {table};"))
    }

    pub fn scalar(&self, sql: &str) -> i64 {
        open_db(self.info.path())
            .unwrap()
            .query_row(sql, [], |row| row.get(0))
            .unwrap()
    }

    pub fn optional_scalar(&self, sql: &str) -> Option<i64> {
        open_db(self.info.path())
            .unwrap()
            .query_row(sql, [], |row| row.get(0))
            .unwrap()
    }

    pub fn text(&self, sql: &str) -> String {
        open_db(self.info.path())
            .unwrap()
            .query_row(sql, [], |row| row.get(0))
            .unwrap()
    }
}
