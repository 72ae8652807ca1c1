use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::error::{PersistenceError, PersistenceResult};
use super::store::{Change, Store, StoreSession};

struct ContextState<Session> {
    session: Session,
    pending: Vec<Change>,
}

/// Change tracker for one message scope.
///
/// Repositories stage changes here; reads merge the staged changes over what
/// the session sees. Clones share the same session and staged changes.
pub struct DbContext<S: Store> {
    id: Uuid,
    state: Arc<Mutex<ContextState<S::Session>>>,
}

impl<S: Store> Clone for DbContext<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: Store> DbContext<S> {
    pub fn new(store: &S) -> PersistenceResult<Self> {
        let session = store.open_session()?;
        let context = Self {
            id: Uuid::new_v4(),
            state: Arc::new(Mutex::new(ContextState {
                session,
                pending: Vec::new(),
            })),
        };
        debug!(context_id = %context.id, "Persistence context opened");
        Ok(context)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn lock(&self, operation: &'static str) -> PersistenceResult<MutexGuard<'_, ContextState<S::Session>>> {
        self.state
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned(operation))
    }

    pub fn load(&self, kind: &str, key: &str) -> PersistenceResult<Option<Vec<u8>>> {
        let mut state = self.lock("load")?;
        if let Some(change) = state.pending.iter().rev().find(|c| c.targets(kind, key)) {
            return Ok(change.document().map(<[u8]>::to_vec));
        }
        state.session.load(kind, key)
    }

    /// Every document of `kind` as this scope sees it, ordered by key.
    pub fn scan(&self, kind: &str) -> PersistenceResult<Vec<(String, Vec<u8>)>> {
        let mut state = self.lock("scan")?;
        let mut documents: BTreeMap<String, Vec<u8>> = state.session.scan(kind)?.into_iter().collect();
        for change in state.pending.iter().filter(|c| c.kind == kind) {
            match change.document() {
                Some(document) => documents.insert(change.key.clone(), document.to_vec()),
                None => documents.remove(&change.key),
            };
        }
        Ok(documents.into_iter().collect())
    }

    pub fn stage(&self, change: Change) -> PersistenceResult<()> {
        self.lock("stage")?.pending.push(change);
        Ok(())
    }

    pub fn pending_count(&self) -> PersistenceResult<usize> {
        Ok(self.lock("pending_count")?.pending.len())
    }

    /// Flushes staged changes to the session. On failure nothing is applied
    /// and the changes stay staged.
    pub fn save_changes(&self) -> PersistenceResult<usize> {
        let mut state = self.lock("save_changes")?;
        let ContextState { session, pending } = &mut *state;
        let applied = session.apply(pending)?;
        pending.clear();
        debug!(context_id = %self.id, applied, "Saved changes");
        Ok(applied)
    }

    pub fn in_transaction(&self) -> PersistenceResult<bool> {
        Ok(self.lock("in_transaction")?.session.in_transaction())
    }

    pub fn begin(&self) -> PersistenceResult<()> {
        self.lock("begin")?.session.begin()
    }

    /// Flushes and commits. Any failure rolls the transaction back and
    /// discards staged changes before the error is returned.
    pub fn commit(&self) -> PersistenceResult<()> {
        let mut state = self.lock("commit")?;
        if !state.session.in_transaction() {
            return Err(PersistenceError::NoActiveTransaction);
        }

        let ContextState { session, pending } = &mut *state;
        let result = session.apply(pending).and_then(|_| session.commit());
        pending.clear();

        if let Err(e) = &result {
            warn!(context_id = %self.id, "Commit failed, rolling back: {}", e);
            if session.in_transaction() {
                if let Err(rollback) = session.rollback() {
                    error!(context_id = %self.id, "Rollback after failed commit failed: {}", rollback);
                }
            }
        }
        result
    }

    pub fn rollback(&self) -> PersistenceResult<()> {
        let mut state = self.lock("rollback")?;
        state.session.rollback()?;
        state.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryStore;
    use crate::persistence::store::ChangeOp;

    fn insert(key: &str, body: &str) -> Change {
        Change::new("order", key, ChangeOp::Insert(body.as_bytes().to_vec()))
    }

    #[test]
    fn staged_changes_are_visible_before_save() {
        let store = MemoryStore::new();
        let context = DbContext::new(&store).unwrap();
        context.stage(insert("1", "a")).unwrap();
        context
            .stage(Change::new("order", "1", ChangeOp::Update(b"b".to_vec())))
            .unwrap();

        assert_eq!(context.load("order", "1").unwrap(), Some(b"b".to_vec()));
        assert_eq!(context.scan("order").unwrap().len(), 1);
        assert!(store.is_empty().unwrap());

        assert_eq!(context.save_changes().unwrap(), 2);
        assert_eq!(context.pending_count().unwrap(), 0);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn staged_delete_hides_the_stored_document() {
        let store = MemoryStore::new();
        let context = DbContext::new(&store).unwrap();
        context.stage(insert("1", "a")).unwrap();
        context.save_changes().unwrap();

        context
            .stage(Change::new("order", "1", ChangeOp::Delete))
            .unwrap();
        assert_eq!(context.load("order", "1").unwrap(), None);
        assert!(context.scan("order").unwrap().is_empty());
    }

    #[test]
    fn failed_commit_rolls_back_and_clears_staged_changes() {
        let store = MemoryStore::new();
        let context = DbContext::new(&store).unwrap();
        context.stage(insert("1", "a")).unwrap();
        context.save_changes().unwrap();

        context.begin().unwrap();
        context.stage(insert("2", "b")).unwrap();
        context.stage(insert("1", "dup")).unwrap();
        assert!(matches!(
            context.commit(),
            Err(PersistenceError::Conflict { .. })
        ));

        assert!(!context.in_transaction().unwrap());
        assert_eq!(context.pending_count().unwrap(), 0);
        assert_eq!(store.len().unwrap(), 1);
    }
}
