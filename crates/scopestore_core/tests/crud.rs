mod common;

use common::{Fixture, Ghost, Invoice, Payment, Product};
use scopestore_core::{ContextError, PersistenceContext};

fn invoice(id: i64, number: &str) -> Invoice {
    Invoice {
        id,
        number: number.to_string(),
        deleted_at: None,
    }
}

#[test]
fn add_or_update_with_existing_key_updates_in_place() {
    let fixture = Fixture::new();
    fixture.exec("INSERT INTO products (id, name) VALUES (7, 'lamp');");
    let products: PersistenceContext<Product> = fixture.fresh();

    let scope = products.write_scope();
    let key = products.add_or_update(&Product::with_id(7, "desk lamp")).unwrap();
    assert_eq!(key.get(), Some(7));
    scope.close().unwrap();

    assert_eq!(fixture.count("products"), 1);
    assert_eq!(fixture.text("SELECT name FROM products WHERE id = 7;"), "desk lamp");
}

#[test]
fn add_or_update_inserts_unknown_entities() {
    let fixture = Fixture::new();
    let products: PersistenceContext<Product> = fixture.fresh();

    let scope = products.write_scope();
    let assigned = products.add_or_update(&Product::new("stool")).unwrap();
    let explicit = products.add_or_update(&Product::with_id(40, "bench")).unwrap();
    assert_eq!(explicit.get(), Some(40));
    scope.close().unwrap();

    let assigned = assigned.get().unwrap();
    assert!(assigned > 0);
    assert_eq!(fixture.count("products"), 2);
    assert_eq!(
        fixture.text(&format!("SELECT name FROM products WHERE id = {assigned};")),
        "stool"
    );
    assert_eq!(fixture.text("SELECT name FROM products WHERE id = 40;"), "bench");
}

#[test]
fn update_requires_an_existing_row() {
    let fixture = Fixture::new();
    fixture.exec("INSERT INTO products (id, name) VALUES (1, 'lamp');");
    let products: PersistenceContext<Product> = fixture.fresh();

    let scope = products.write_scope();
    assert!(matches!(
        products.update(&Product::with_id(99, "ghost")),
        Err(ContextError::NotFound { model: "Product", key: 99 })
    ));
    assert!(matches!(
        products.update(&Product::new("unsaved")),
        Err(ContextError::NotFound { key: 0, .. })
    ));
    products.update(&Product::with_id(1, "floor lamp")).unwrap();
    scope.close().unwrap();

    assert_eq!(fixture.count("products"), 1);
    assert_eq!(fixture.text("SELECT name FROM products WHERE id = 1;"), "floor lamp");
}

#[test]
fn soft_delete_stamps_once() {
    let fixture = Fixture::new();
    fixture.exec("INSERT INTO invoices (id, number) VALUES (1, 'INV-1');");

    let invoices: PersistenceContext<Invoice> = fixture.fresh();
    let scope = invoices.write_scope();
    invoices.delete(&invoice(1, "INV-1")).unwrap();
    scope.close().unwrap();

    let first = fixture
        .optional_scalar("SELECT deleted_at FROM invoices WHERE id = 1;")
        .unwrap();
    assert!(first > 0);

    std::thread::sleep(std::time::Duration::from_millis(5));
    let invoices: PersistenceContext<Invoice> = fixture.fresh();
    let scope = invoices.write_scope();
    invoices.delete(&invoice(1, "INV-1")).unwrap();
    scope.close().unwrap();

    assert_eq!(fixture.count("invoices"), 1);
    assert_eq!(
        fixture.optional_scalar("SELECT deleted_at FROM invoices WHERE id = 1;"),
        Some(first)
    );
}

#[test]
fn soft_delete_keeps_an_existing_timestamp() {
    let fixture = Fixture::new();
    fixture.exec("INSERT INTO invoices (id, number, deleted_at) VALUES (3, 'INV-3', 123);");
    let invoices: PersistenceContext<Invoice> = fixture.fresh();

    let scope = invoices.write_scope();
    invoices.delete(&invoice(3, "INV-3")).unwrap();
    scope.close().unwrap();

    assert_eq!(
        fixture.optional_scalar("SELECT deleted_at FROM invoices WHERE id = 3;"),
        Some(123)
    );
}

#[test]
fn hard_delete_removes_the_row() {
    let fixture = Fixture::new();
    fixture.exec("INSERT INTO products (id, name) VALUES (1, 'lamp'), (2, 'desk');");
    let products: PersistenceContext<Product> = fixture.fresh();

    let scope = products.write_scope();
    products.delete(&Product::with_id(2, "desk")).unwrap();
    assert!(matches!(
        products.delete(&Product::with_id(8, "missing")),
        Err(ContextError::NotFound { key: 8, .. })
    ));
    assert!(matches!(
        products.delete(&Product::new("unsaved")),
        Err(ContextError::InvalidArgument(_))
    ));
    scope.close().unwrap();

    assert_eq!(fixture.count("products"), 1);
    assert_eq!(fixture.scalar("SELECT id FROM products;"), 1);
}

#[test]
fn invalid_entities_are_rejected_before_tracking() {
    let fixture = Fixture::new();
    let products: PersistenceContext<Product> = fixture.fresh();

    let scope = products.write_scope();
    assert!(matches!(
        products.add(&Product::with_id(-1, "negative")),
        Err(ContextError::InvalidArgument(_))
    ));
    assert!(matches!(
        products.add(&Product::new("  ")),
        Err(ContextError::InvalidArgument(message)) if message.contains("product name is empty")
    ));
    let batch = [Product::new("chair"), Product::new("")];
    assert!(matches!(
        products.add_range(&batch),
        Err(ContextError::InvalidArgument(_))
    ));
    scope.close().unwrap();

    assert_eq!(fixture.count("products"), 0);
}

#[test]
fn add_range_resolves_every_key_on_commit() {
    let fixture = Fixture::new();
    let products: PersistenceContext<Product> = fixture.fresh();
    let batch = [Product::new("chair"), Product::new("table"), Product::new("shelf")];

    let scope = products.write_scope();
    let keys = products.add_range(&batch).unwrap();
    assert!(keys.iter().all(|key| key.get().is_none()));
    scope.close().unwrap();

    let ids: Vec<i64> = keys.iter().map(|key| key.get().unwrap()).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(fixture.count("products"), 3);
}

#[test]
fn single_use_context_is_spent_after_its_scope() {
    let fixture = Fixture::new();
    let products: PersistenceContext<Product> = fixture.fresh();

    let scope = products.write_scope();
    let key = products.add(&Product::new("lamp")).unwrap();
    scope.close().unwrap();

    let id = key.get().unwrap();
    assert!(!products.is_valid());
    assert!(matches!(products.find(id), Err(ContextError::Disposed(_))));

    let reread: PersistenceContext<Product> = fixture.fresh();
    assert_eq!(reread.find(id).unwrap(), Some(Product::with_id(id, "lamp")));
}

#[test]
fn context_requires_a_storage_set() {
    let fixture = Fixture::new();
    let created = PersistenceContext::<Ghost>::new(fixture.single_use(), fixture.registry.clone());

    assert!(matches!(
        created,
        Err(ContextError::TypeMismatch { model: "Ghost", set: "ghosts" })
    ));
}

#[test]
fn misdeclared_collection_is_reported_as_configuration() {
    let fixture = Fixture::new();
    let payments: PersistenceContext<Payment> = fixture.fresh();

    let scope = payments.write_scope();
    let err = payments.add(&Payment { id: 0, amount: 10 }).unwrap_err();
    scope.close().unwrap();

    match err {
        ContextError::Configuration { message, .. } => {
            assert!(message.contains("Receipts"));
            assert!(message.contains("Navigation::many"));
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
    assert_eq!(fixture.count("payments"), 0);
}
