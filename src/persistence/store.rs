use super::error::PersistenceResult;

/// One staged mutation of a stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    /// Fails with `Conflict` if the key exists.
    Insert(Vec<u8>),
    /// Fails with `NotFound` if the key is missing.
    Update(Vec<u8>),
    /// Fails with `NotFound` if the key is missing.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: String,
    pub key: String,
    pub op: ChangeOp,
}

impl Change {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, op: ChangeOp) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            op,
        }
    }

    pub fn targets(&self, kind: &str, key: &str) -> bool {
        self.kind == kind && self.key == key
    }

    /// The document this change leaves behind, `None` for a delete.
    pub fn document(&self) -> Option<&[u8]> {
        match &self.op {
            ChangeOp::Insert(document) | ChangeOp::Update(document) => Some(document),
            ChangeOp::Delete => None,
        }
    }
}

/// Handle to a persistent store. Cheap to clone; sessions are opened per scope.
pub trait Store: Clone + Send + Sync + 'static {
    type Session: StoreSession;

    fn open_session(&self) -> PersistenceResult<Self::Session>;
}

/// A single connection to the store. Calls may block.
pub trait StoreSession: Send {
    fn load(&mut self, kind: &str, key: &str) -> PersistenceResult<Option<Vec<u8>>>;

    /// All documents of `kind`, ordered by key.
    fn scan(&mut self, kind: &str) -> PersistenceResult<Vec<(String, Vec<u8>)>>;

    /// Applies all changes or none of them and returns how many were applied.
    /// Inside a transaction the writes stay private until `commit`.
    fn apply(&mut self, changes: &[Change]) -> PersistenceResult<usize>;

    fn begin(&mut self) -> PersistenceResult<()>;

    fn commit(&mut self) -> PersistenceResult<()>;

    fn rollback(&mut self) -> PersistenceResult<()>;

    fn in_transaction(&self) -> bool;
}
