use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use rabbit_service_kit::config::StoreConfig;
use rabbit_service_kit::{Entity, MemoryStore, PersistenceError, SqliteStore, Store, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    sku: String,
    name: String,
    stock: u32,
}

impl Entity for Product {
    type Key = String;
    const KIND: &'static str = "product";

    fn key(&self) -> String {
        self.sku.clone()
    }
}

fn product(sku: &str, stock: u32) -> Product {
    Product {
        sku: sku.to_string(),
        name: format!("Product {}", sku),
        stock,
    }
}

fn sqlite_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(StoreConfig {
        connection_string: dir.path().join("products.db").display().to_string(),
        ..StoreConfig::default()
    })
    .unwrap()
}

fn reads_see_staged_writes<S: Store>(store: &S) {
    let mut uow = UnitOfWork::new(store).unwrap();
    let products = uow.repository::<Product>();

    uow.begin_transaction().unwrap();
    products.add(product("A-1", 5)).unwrap();
    assert_eq!(
        products.get_by_id(&"A-1".to_string()).unwrap(),
        Some(product("A-1", 5))
    );
    assert_eq!(products.count().unwrap(), 1);

    // other scopes see nothing yet
    let other = UnitOfWork::new(store).unwrap();
    assert_eq!(other.repository::<Product>().count().unwrap(), 0);
    drop(other);

    uow.commit_transaction().unwrap();
    drop(uow);

    let fresh = UnitOfWork::new(store).unwrap();
    assert_eq!(
        fresh.repository::<Product>().get_by_id(&"A-1".to_string()).unwrap(),
        Some(product("A-1", 5))
    );
}

fn queries_and_mutations<S: Store>(store: &S) {
    let mut uow = UnitOfWork::new(store).unwrap();
    let products = uow.repository::<Product>();

    for (sku, stock) in [("B-2", 0), ("A-1", 3), ("C-3", 12)] {
        products.add(product(sku, stock)).unwrap();
    }
    assert_eq!(uow.save_changes().unwrap(), 3);

    let skus: Vec<String> = products.get_all().unwrap().into_iter().map(|p| p.sku).collect();
    assert_eq!(skus, vec!["A-1", "B-2", "C-3"]);

    let in_stock = products.find(|p| p.stock > 0).unwrap();
    assert_eq!(in_stock.len(), 2);
    assert_eq!(products.count_where(|p| p.stock == 0).unwrap(), 1);

    let mut restocked = product("B-2", 0);
    restocked.stock = 40;
    products.update(restocked.clone()).unwrap();
    assert_eq!(products.get_by_id(&"B-2".to_string()).unwrap(), Some(restocked));

    products.delete(&product("C-3", 12)).unwrap();
    assert!(!products.exists(&"C-3".to_string()).unwrap());
    assert!(products.delete_by_id(&"A-1".to_string()).unwrap());
    assert!(!products.delete_by_id(&"Z-9".to_string()).unwrap());

    assert_eq!(products.save_changes().unwrap(), 3);
    assert_eq!(products.count().unwrap(), 1);
}

fn update_of_missing_entity_fails_on_flush<S: Store>(store: &S) {
    let mut uow = UnitOfWork::new(store).unwrap();
    let products = uow.repository::<Product>();

    products.update(product("X-1", 1)).unwrap();
    assert!(matches!(
        uow.save_changes(),
        Err(PersistenceError::NotFound { .. })
    ));
}

#[test]
fn memory_read_your_writes() {
    reads_see_staged_writes(&MemoryStore::new());
}

#[test]
fn memory_queries_and_mutations() {
    queries_and_mutations(&MemoryStore::new());
}

#[test]
fn memory_missing_update() {
    update_of_missing_entity_fails_on_flush(&MemoryStore::new());
}

#[test]
fn sqlite_read_your_writes() {
    let dir = TempDir::new().unwrap();
    reads_see_staged_writes(&sqlite_store(&dir));
}

#[test]
fn sqlite_queries_and_mutations() {
    let dir = TempDir::new().unwrap();
    queries_and_mutations(&sqlite_store(&dir));
}

#[test]
fn sqlite_missing_update() {
    let dir = TempDir::new().unwrap();
    update_of_missing_entity_fails_on_flush(&sqlite_store(&dir));
}

#[test]
fn sqlite_data_survives_reopening_the_store() {
    let dir = TempDir::new().unwrap();
    {
        let mut uow = UnitOfWork::new(&sqlite_store(&dir)).unwrap();
        uow.repository::<Product>().add(product("A-1", 1)).unwrap();
        uow.save_changes().unwrap();
    }

    let reopened = sqlite_store(&dir);
    let uow = UnitOfWork::new(&reopened).unwrap();
    assert!(uow.repository::<Product>().exists(&"A-1".to_string()).unwrap());
}
