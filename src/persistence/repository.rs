use std::marker::PhantomData;

use super::context::DbContext;
use super::entity::{decode_entity, encode_entity, encode_key, Entity};
use super::error::PersistenceResult;
use super::store::{Change, ChangeOp, Store};

/// Typed access to one entity kind within a scope.
///
/// Mutations are staged in the shared [`DbContext`] and reach the store on
/// [`save_changes`](Repository::save_changes) or on commit of the owning
/// unit of work.
pub struct Repository<T: Entity, S: Store> {
    context: DbContext<S>,
    entity: PhantomData<fn() -> T>,
}

impl<T: Entity, S: Store> Clone for Repository<T, S> {
    fn clone(&self) -> Self {
        Self::new(self.context.clone())
    }
}

impl<T: Entity, S: Store> Repository<T, S> {
    pub fn new(context: DbContext<S>) -> Self {
        Self {
            context,
            entity: PhantomData,
        }
    }

    pub fn get_by_id(&self, key: &T::Key) -> PersistenceResult<Option<T>> {
        let key = encode_key(key)?;
        self.context
            .load(T::KIND, &key)?
            .map(|document| decode_entity(&document))
            .transpose()
    }

    pub fn get_all(&self) -> PersistenceResult<Vec<T>> {
        self.context
            .scan(T::KIND)?
            .iter()
            .map(|(_, document)| decode_entity(document))
            .collect()
    }

    pub fn find<P>(&self, predicate: P) -> PersistenceResult<Vec<T>>
    where
        P: Fn(&T) -> bool,
    {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|entity| predicate(entity))
            .collect())
    }

    /// Stages an insert. A duplicate key surfaces as `Conflict` when flushed.
    pub fn add(&self, entity: T) -> PersistenceResult<T> {
        let key = encode_key(&entity.key())?;
        let document = encode_entity(&entity)?;
        self.context
            .stage(Change::new(T::KIND, key, ChangeOp::Insert(document)))?;
        Ok(entity)
    }

    pub fn update(&self, entity: T) -> PersistenceResult<T> {
        let key = encode_key(&entity.key())?;
        let document = encode_entity(&entity)?;
        self.context
            .stage(Change::new(T::KIND, key, ChangeOp::Update(document)))?;
        Ok(entity)
    }

    pub fn delete(&self, entity: &T) -> PersistenceResult<()> {
        let key = encode_key(&entity.key())?;
        self.context
            .stage(Change::new(T::KIND, key, ChangeOp::Delete))
    }

    /// Stages a delete if the entity exists; returns whether it did.
    pub fn delete_by_id(&self, key: &T::Key) -> PersistenceResult<bool> {
        let key = encode_key(key)?;
        if self.context.load(T::KIND, &key)?.is_none() {
            return Ok(false);
        }
        self.context
            .stage(Change::new(T::KIND, key, ChangeOp::Delete))?;
        Ok(true)
    }

    pub fn exists(&self, key: &T::Key) -> PersistenceResult<bool> {
        let key = encode_key(key)?;
        Ok(self.context.load(T::KIND, &key)?.is_some())
    }

    pub fn count(&self) -> PersistenceResult<usize> {
        Ok(self.context.scan(T::KIND)?.len())
    }

    pub fn count_where<P>(&self, predicate: P) -> PersistenceResult<usize>
    where
        P: Fn(&T) -> bool,
    {
        Ok(self.find(predicate)?.len())
    }

    pub fn save_changes(&self) -> PersistenceResult<usize> {
        self.context.save_changes()
    }
}
