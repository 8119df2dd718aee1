use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A referenced record (`kind`) does not exist.
    Reference { kind: &'static str, id: Ulid },
    /// A business rule was violated.
    Validation(&'static str),
    /// Room/time overlap with the given defense.
    Conflict(Ulid),
    /// A unique field (`field`) is already taken.
    Duplicate { field: &'static str, value: String },
    HasDependents { id: Ulid, dependents: &'static str },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to pgwire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) | EngineError::Duplicate { .. } => "23505",
            EngineError::Reference { .. } | EngineError::HasDependents { .. } => "23503",
            EngineError::Validation(_) => "23514",
            EngineError::Conflict(_) => "23P01",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Reference { kind, id } => {
                write!(f, "referenced {kind} does not exist: {id}")
            }
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::Conflict(id) => write!(f, "room is not available: conflicts with defense {id}"),
            EngineError::Duplicate { field, value } => {
                write!(f, "{field} already in use: {value}")
            }
            EngineError::HasDependents { id, dependents } => {
                write!(f, "cannot delete {id}: still referenced by {dependents}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
