use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use rabbit_service_kit::config::StoreConfig;
use rabbit_service_kit::{Entity, MemoryStore, PersistenceError, SqliteStore, Store, UnitOfWork};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    customer: String,
}

impl Entity for Order {
    type Key = u64;
    const KIND: &'static str = "order";

    fn key(&self) -> u64 {
        self.id
    }
}

fn order(id: u64) -> Order {
    Order {
        id,
        customer: format!("customer-{}", id),
    }
}

fn sqlite_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(StoreConfig {
        connection_string: dir.path().join("uow.db").display().to_string(),
        ..StoreConfig::default()
    })
    .unwrap()
}

fn double_begin_keeps_first_transaction<S: Store>(store: &S) {
    let mut uow = UnitOfWork::new(store).unwrap();
    uow.begin_transaction().unwrap();

    assert!(matches!(
        uow.begin_transaction(),
        Err(PersistenceError::TransactionAlreadyActive)
    ));
    assert!(uow.is_transaction_active());

    uow.repository::<Order>().add(order(1)).unwrap();
    uow.commit_transaction().unwrap();
    assert!(!uow.is_transaction_active());

    let reader = UnitOfWork::new(store).unwrap();
    assert_eq!(reader.repository::<Order>().get_by_id(&1).unwrap(), Some(order(1)));
}

fn commit_without_transaction_has_no_effect<S: Store>(store: &S) {
    let mut uow = UnitOfWork::new(store).unwrap();
    uow.repository::<Order>().add(order(2)).unwrap();

    assert!(matches!(
        uow.commit_transaction(),
        Err(PersistenceError::NoActiveTransaction)
    ));

    let reader = UnitOfWork::new(store).unwrap();
    assert!(!reader.repository::<Order>().exists(&2).unwrap());
}

fn failed_commit_rolls_back_and_allows_begin<S: Store>(store: &S) {
    let mut setup = UnitOfWork::new(store).unwrap();
    setup.repository::<Order>().add(order(3)).unwrap();
    setup.save_changes().unwrap();

    let mut uow = UnitOfWork::new(store).unwrap();
    let orders = uow.repository::<Order>();
    uow.begin_transaction().unwrap();
    orders.add(order(4)).unwrap();
    orders.add(order(3)).unwrap();

    assert!(matches!(
        uow.commit_transaction(),
        Err(PersistenceError::Conflict { .. })
    ));
    assert!(!uow.is_transaction_active());
    assert!(!orders.exists(&4).unwrap());

    uow.begin_transaction().unwrap();
    orders.add(order(5)).unwrap();
    uow.commit_transaction().unwrap();

    let reader = UnitOfWork::new(store).unwrap();
    let ids: Vec<u64> = reader
        .repository::<Order>()
        .get_all()
        .unwrap()
        .into_iter()
        .map(|o| o.id)
        .collect();
    assert_eq!(ids, vec![3, 5]);
}

fn rollback_discards_everything<S: Store>(store: &S) {
    let mut uow = UnitOfWork::new(store).unwrap();
    let orders = uow.repository::<Order>();

    assert!(matches!(
        uow.rollback_transaction(),
        Err(PersistenceError::NoActiveTransaction)
    ));

    uow.begin_transaction().unwrap();
    orders.add(order(6)).unwrap();
    uow.save_changes().unwrap();
    orders.add(order(7)).unwrap();
    uow.rollback_transaction().unwrap();

    assert!(!orders.exists(&6).unwrap());
    assert!(!orders.exists(&7).unwrap());
    assert_eq!(uow.context().pending_count().unwrap(), 0);
}

fn drop_rolls_back_open_transaction<S: Store>(store: &S) {
    {
        let mut uow = UnitOfWork::new(store).unwrap();
        uow.begin_transaction().unwrap();
        uow.repository::<Order>().add(order(8)).unwrap();
        uow.save_changes().unwrap();
    }

    let reader = UnitOfWork::new(store).unwrap();
    assert!(!reader.repository::<Order>().exists(&8).unwrap());
}

#[test]
fn memory_double_begin() {
    double_begin_keeps_first_transaction(&MemoryStore::new());
}

#[test]
fn memory_commit_without_transaction() {
    commit_without_transaction_has_no_effect(&MemoryStore::new());
}

#[test]
fn memory_failed_commit() {
    failed_commit_rolls_back_and_allows_begin(&MemoryStore::new());
}

#[test]
fn memory_rollback() {
    rollback_discards_everything(&MemoryStore::new());
}

#[test]
fn memory_drop_rolls_back() {
    drop_rolls_back_open_transaction(&MemoryStore::new());
}

#[test]
fn sqlite_double_begin() {
    let dir = TempDir::new().unwrap();
    double_begin_keeps_first_transaction(&sqlite_store(&dir));
}

#[test]
fn sqlite_commit_without_transaction() {
    let dir = TempDir::new().unwrap();
    commit_without_transaction_has_no_effect(&sqlite_store(&dir));
}

#[test]
fn sqlite_failed_commit() {
    let dir = TempDir::new().unwrap();
    failed_commit_rolls_back_and_allows_begin(&sqlite_store(&dir));
}

#[test]
fn sqlite_rollback() {
    let dir = TempDir::new().unwrap();
    rollback_discards_everything(&sqlite_store(&dir));
}

#[test]
fn sqlite_drop_rolls_back() {
    let dir = TempDir::new().unwrap();
    drop_rolls_back_open_transaction(&sqlite_store(&dir));
}

#[test]
fn memory_concurrent_adds_of_one_key_keep_the_first_commit() {
    let store = MemoryStore::new();
    let mut first = UnitOfWork::new(&store).unwrap();
    let mut second = UnitOfWork::new(&store).unwrap();

    for (uow, customer) in [(&mut first, "first"), (&mut second, "second")] {
        uow.begin_transaction().unwrap();
        uow.repository::<Order>()
            .add(Order {
                id: 1,
                customer: customer.to_string(),
            })
            .unwrap();
        uow.save_changes().unwrap();
    }

    first.commit_transaction().unwrap();
    assert!(matches!(
        second.commit_transaction(),
        Err(PersistenceError::Conflict { .. })
    ));
    assert!(!second.is_transaction_active());

    let reader = UnitOfWork::new(&store).unwrap();
    let stored = reader.repository::<Order>().get_by_id(&1).unwrap().unwrap();
    assert_eq!(stored.customer, "first");
}
