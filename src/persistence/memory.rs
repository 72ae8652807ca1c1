use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::error::{PersistenceError, PersistenceResult};
use super::store::{Change, ChangeOp, Store, StoreSession};

type DocumentId = (String, String);
type Documents = BTreeMap<DocumentId, Vec<u8>>;
/// Pending writes of one session; `None` marks a delete.
type Overlay = BTreeMap<DocumentId, Option<Vec<u8>>>;

/// An open transaction: its private writes plus, for every key it wrote,
/// whether the key was committed when the transaction first touched it.
#[derive(Default)]
struct Transaction {
    overlay: Overlay,
    expected: BTreeMap<DocumentId, bool>,
}

impl Transaction {
    /// Fails if another session committed a write to one of our keys since
    /// we first touched it.
    fn verify(&self, documents: &Documents) -> PersistenceResult<()> {
        for (id, existed) in &self.expected {
            match (existed, documents.contains_key(id)) {
                (false, true) => return Err(PersistenceError::conflict(&id.0, &id.1)),
                (true, false) => return Err(PersistenceError::not_found(&id.0, &id.1)),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Process-local store shared by every session opened from it.
#[derive(Clone, Default)]
pub struct MemoryStore {
    documents: Arc<Mutex<Documents>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed documents.
    pub fn len(&self) -> PersistenceResult<usize> {
        let documents = self
            .documents
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned("len"))?;
        Ok(documents.len())
    }

    pub fn is_empty(&self) -> PersistenceResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl Store for MemoryStore {
    type Session = MemorySession;

    fn open_session(&self) -> PersistenceResult<MemorySession> {
        Ok(MemorySession {
            documents: Arc::clone(&self.documents),
            transaction: None,
        })
    }
}

pub struct MemorySession {
    documents: Arc<Mutex<Documents>>,
    transaction: Option<Transaction>,
}

impl MemorySession {
    fn lock(&self, operation: &'static str) -> PersistenceResult<std::sync::MutexGuard<'_, Documents>> {
        self.documents
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned(operation))
    }
}

fn visible(documents: &Documents, transaction: Option<&Transaction>, id: &DocumentId) -> Option<Vec<u8>> {
    match transaction.and_then(|tx| tx.overlay.get(id)) {
        Some(pending) => pending.clone(),
        None => documents.get(id).cloned(),
    }
}

impl StoreSession for MemorySession {
    fn load(&mut self, kind: &str, key: &str) -> PersistenceResult<Option<Vec<u8>>> {
        let documents = self.lock("load")?;
        let id = (kind.to_string(), key.to_string());
        Ok(visible(&documents, self.transaction.as_ref(), &id))
    }

    fn scan(&mut self, kind: &str) -> PersistenceResult<Vec<(String, Vec<u8>)>> {
        let documents = self.lock("scan")?;
        let mut found: BTreeMap<String, Vec<u8>> = documents
            .iter()
            .filter(|((doc_kind, _), _)| doc_kind == kind)
            .map(|((_, key), document)| (key.clone(), document.clone()))
            .collect();

        if let Some(transaction) = &self.transaction {
            for ((doc_kind, key), pending) in &transaction.overlay {
                if doc_kind != kind {
                    continue;
                }
                match pending {
                    Some(document) => found.insert(key.clone(), document.clone()),
                    None => found.remove(key),
                };
            }
        }

        Ok(found.into_iter().collect())
    }

    fn apply(&mut self, changes: &[Change]) -> PersistenceResult<usize> {
        let mut documents = self
            .documents
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned("apply"))?;

        // validate everything before touching shared state
        let mut staged = Overlay::new();
        for change in changes {
            let id = (change.kind.clone(), change.key.clone());
            let exists = match staged.get(&id) {
                Some(pending) => pending.is_some(),
                None => visible(&documents, self.transaction.as_ref(), &id).is_some(),
            };

            match &change.op {
                ChangeOp::Insert(_) if exists => {
                    return Err(PersistenceError::conflict(&change.kind, &change.key))
                }
                ChangeOp::Update(_) | ChangeOp::Delete if !exists => {
                    return Err(PersistenceError::not_found(&change.kind, &change.key))
                }
                _ => {}
            }
            staged.insert(id, change.document().map(<[u8]>::to_vec));
        }

        match self.transaction.as_mut() {
            Some(transaction) => {
                for id in staged.keys() {
                    transaction
                        .expected
                        .entry(id.clone())
                        .or_insert_with(|| documents.contains_key(id));
                }
                transaction.overlay.extend(staged);
            }
            None => write_through(&mut documents, staged),
        }
        Ok(changes.len())
    }

    fn begin(&mut self) -> PersistenceResult<()> {
        if self.transaction.is_some() {
            return Err(PersistenceError::TransactionAlreadyActive);
        }
        self.transaction = Some(Transaction::default());
        Ok(())
    }

    /// A failed commit leaves the transaction open for the caller to roll back.
    fn commit(&mut self) -> PersistenceResult<()> {
        let mut documents = self
            .documents
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned("commit"))?;
        let transaction = self
            .transaction
            .as_ref()
            .ok_or(PersistenceError::NoActiveTransaction)?;
        transaction.verify(&documents)?;

        if let Some(transaction) = self.transaction.take() {
            write_through(&mut documents, transaction.overlay);
        }
        Ok(())
    }

    fn rollback(&mut self) -> PersistenceResult<()> {
        self.transaction
            .take()
            .map(|_| ())
            .ok_or(PersistenceError::NoActiveTransaction)
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

fn write_through(documents: &mut Documents, overlay: Overlay) {
    for (id, pending) in overlay {
        match pending {
            Some(document) => documents.insert(id, document),
            None => documents.remove(&id),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(key: &str, body: &str) -> Change {
        Change::new("order", key, ChangeOp::Insert(body.as_bytes().to_vec()))
    }

    #[test]
    fn writes_outside_a_transaction_are_shared() {
        let store = MemoryStore::new();
        let mut writer = store.open_session().unwrap();
        let mut reader = store.open_session().unwrap();

        assert_eq!(writer.apply(&[insert("1", "a")]).unwrap(), 1);
        assert_eq!(reader.load("order", "1").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn transactional_writes_stay_private_until_commit() {
        let store = MemoryStore::new();
        let mut writer = store.open_session().unwrap();
        let mut reader = store.open_session().unwrap();

        writer.begin().unwrap();
        writer.apply(&[insert("1", "a")]).unwrap();
        assert_eq!(writer.load("order", "1").unwrap(), Some(b"a".to_vec()));
        assert_eq!(reader.load("order", "1").unwrap(), None);

        writer.commit().unwrap();
        assert_eq!(reader.load("order", "1").unwrap(), Some(b"a".to_vec()));
        assert!(!writer.in_transaction());
    }

    #[test]
    fn failed_apply_changes_nothing() {
        let store = MemoryStore::new();
        let mut session = store.open_session().unwrap();
        session.apply(&[insert("1", "a")]).unwrap();

        let err = session
            .apply(&[insert("2", "b"), insert("1", "again")])
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict { .. }));
        assert_eq!(session.load("order", "2").unwrap(), None);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn update_and_delete_require_an_existing_document() {
        let store = MemoryStore::new();
        let mut session = store.open_session().unwrap();

        let update = Change::new("order", "9", ChangeOp::Update(b"x".to_vec()));
        assert!(matches!(
            session.apply(&[update]).unwrap_err(),
            PersistenceError::NotFound { .. }
        ));

        session
            .apply(&[insert("9", "x"), Change::new("order", "9", ChangeOp::Delete)])
            .unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn scan_merges_transaction_overlay_in_key_order() {
        let store = MemoryStore::new();
        let mut session = store.open_session().unwrap();
        session.apply(&[insert("1", "a"), insert("3", "c")]).unwrap();

        session.begin().unwrap();
        session
            .apply(&[insert("2", "b"), Change::new("order", "3", ChangeOp::Delete)])
            .unwrap();

        let keys: Vec<String> = session
            .scan("order")
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["1", "2"]);

        session.rollback().unwrap();
        assert_eq!(session.scan("order").unwrap().len(), 2);
    }

    #[test]
    fn transaction_state_errors() {
        let store = MemoryStore::new();
        let mut session = store.open_session().unwrap();

        assert!(matches!(session.commit(), Err(PersistenceError::NoActiveTransaction)));
        assert!(matches!(session.rollback(), Err(PersistenceError::NoActiveTransaction)));
        session.begin().unwrap();
        assert!(matches!(session.begin(), Err(PersistenceError::TransactionAlreadyActive)));
    }

    #[test]
    fn concurrent_inserts_of_one_key_conflict_at_commit() {
        let store = MemoryStore::new();
        let mut first = store.open_session().unwrap();
        let mut second = store.open_session().unwrap();

        first.begin().unwrap();
        second.begin().unwrap();
        first.apply(&[insert("1", "first")]).unwrap();
        second.apply(&[insert("1", "second")]).unwrap();

        first.commit().unwrap();
        assert!(matches!(second.commit(), Err(PersistenceError::Conflict { .. })));
        assert!(second.in_transaction());
        second.rollback().unwrap();

        assert_eq!(first.load("order", "1").unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn update_of_a_concurrently_deleted_key_fails_at_commit() {
        let store = MemoryStore::new();
        let mut setup = store.open_session().unwrap();
        setup.apply(&[insert("1", "a")]).unwrap();

        let mut writer = store.open_session().unwrap();
        writer.begin().unwrap();
        writer
            .apply(&[Change::new("order", "1", ChangeOp::Update(b"b".to_vec()))])
            .unwrap();

        setup
            .apply(&[Change::new("order", "1", ChangeOp::Delete)])
            .unwrap();
        assert!(matches!(writer.commit(), Err(PersistenceError::NotFound { .. })));
        assert!(store.is_empty().unwrap());
    }
}
