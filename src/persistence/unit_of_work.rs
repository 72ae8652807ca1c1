use tracing::{debug, error, warn};

use super::context::DbContext;
use super::entity::Entity;
use super::error::{PersistenceError, PersistenceResult};
use super::repository::Repository;
use super::store::Store;

/// Transaction boundary for one message scope.
///
/// Owns the scope's [`DbContext`]; repositories handed out by
/// [`repository`](UnitOfWork::repository) share it. Dropping a unit of work
/// with an open transaction rolls it back.
///
/// Store calls block the calling thread. Handlers running on the tokio
/// runtime should move store work onto the blocking pool with
/// [`run_blocking`](UnitOfWork::run_blocking).
pub struct UnitOfWork<S: Store> {
    context: DbContext<S>,
}

impl<S: Store> UnitOfWork<S> {
    pub fn new(store: &S) -> PersistenceResult<Self> {
        Ok(Self::from_context(DbContext::new(store)?))
    }

    pub fn from_context(context: DbContext<S>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &DbContext<S> {
        &self.context
    }

    pub fn repository<T: Entity>(&self) -> Repository<T, S> {
        Repository::new(self.context.clone())
    }

    pub fn begin_transaction(&mut self) -> PersistenceResult<()> {
        self.context.begin()?;
        debug!(context_id = %self.context.id(), "Transaction started");
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> PersistenceResult<()> {
        self.context.commit()?;
        debug!(context_id = %self.context.id(), "Transaction committed");
        Ok(())
    }

    pub fn rollback_transaction(&mut self) -> PersistenceResult<()> {
        self.context.rollback()?;
        debug!(context_id = %self.context.id(), "Transaction rolled back");
        Ok(())
    }

    pub fn save_changes(&mut self) -> PersistenceResult<usize> {
        self.context.save_changes()
    }

    pub fn is_transaction_active(&self) -> bool {
        self.context.in_transaction().unwrap_or(false)
    }

    /// Runs `work` against this unit of work's context on tokio's blocking
    /// pool. The closure shares the context, so transaction state and staged
    /// changes are visible on both sides once it returns.
    pub async fn run_blocking<T, F>(&self, work: F) -> PersistenceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(DbContext<S>) -> PersistenceResult<T> + Send + 'static,
    {
        let context = self.context.clone();
        tokio::task::spawn_blocking(move || work(context))
            .await
            .map_err(|e| PersistenceError::Blocking(e.to_string()))?
    }
}

impl<S: Store> Drop for UnitOfWork<S> {
    fn drop(&mut self) {
        if !self.is_transaction_active() {
            return;
        }
        warn!(context_id = %self.context.id(), "Unit of work dropped with an open transaction, rolling back");
        match self.context.rollback() {
            Ok(()) | Err(PersistenceError::NoActiveTransaction) => {}
            Err(e) => error!(context_id = %self.context.id(), "Rollback on drop failed: {}", e),
        }
    }
}
