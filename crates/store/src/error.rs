use envspot_contracts::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub(crate) fn timeout(operation: &'static str) -> Self {
        tracing::warn!(operation, "store operation timed out");
        Self::new(
            ErrorKind::Unavailable,
            format!("{} timed out", operation),
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for StoreError {}

/// What a failing statement was acting on; used to word caller-visible messages.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Subject<'a> {
    Application { id: &'a str, name: &'a str },
    ApplicationId(&'a str),
    Contour {
        id: &'a str,
        application_id: &'a str,
        name: &'a str,
    },
    ContourId(&'a str),
}

impl Subject<'_> {
    fn missing(self) -> String {
        match self {
            Subject::Application { id, .. } | Subject::ApplicationId(id) => {
                format!("application with this id can't be found: {}", id)
            }
            Subject::Contour { id, .. } | Subject::ContourId(id) => {
                format!("contour with this id can't be found: {}", id)
            }
        }
    }

    fn conflict(self) -> String {
        match self {
            Subject::Application { name, .. } => {
                format!("application with this name already exists: {}", name)
            }
            Subject::Contour {
                application_id,
                name,
                ..
            } => format!(
                "contour with this name already exists in application {}: {}",
                application_id, name
            ),
            Subject::ApplicationId(id) | Subject::ContourId(id) => {
                format!("resource already exists: {}", id)
            }
        }
    }

    fn missing_parent(self) -> String {
        match self {
            Subject::Contour { application_id, .. } => format!(
                "application with this id can't be found: {}",
                application_id
            ),
            other => other.missing(),
        }
    }
}

pub(crate) fn translate(operation: &'static str, subject: Subject<'_>, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::RowNotFound => StoreError::not_found(subject.missing()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::already_exists(subject.conflict())
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::not_found(subject.missing_parent())
        }
        sqlx::Error::PoolTimedOut => {
            tracing::warn!(operation, "store connection pool exhausted");
            StoreError::new(
                ErrorKind::Unavailable,
                format!("{} could not acquire a connection", operation),
            )
        }
        _ => {
            tracing::error!(operation, error = %err, "store operation failed");
            StoreError::new(ErrorKind::Internal, format!("{} failed", operation))
        }
    }
}
