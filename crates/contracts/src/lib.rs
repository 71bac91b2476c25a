use serde::{Deserialize, Serialize};

/// Caller-visible error kinds shared by every layer of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Aborted,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Unauthenticated => "UNAUTHENTICATED",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::Aborted => "ABORTED",
            ErrorKind::Unavailable => "UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists | ErrorKind::Aborted => 409,
            ErrorKind::Unavailable => 503,
            ErrorKind::Internal => 500,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable)
    }
}

/// Access levels understood by the rights service. Each level implies the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessRight {
    Read,
    Write,
    Delete,
}

impl AccessRight {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessRight::Read => "READ",
            AccessRight::Write => "WRITE",
            AccessRight::Delete => "DELETE",
        }
    }
}

/// An application without its contour list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationFull {
    pub id: String,
    pub name: String,
    pub description: String,
    pub contours: Vec<String>,
}

impl From<ApplicationFull> for Application {
    fn from(value: ApplicationFull) -> Self {
        Self {
            id: value.id,
            name: value.name,
            description: value.description,
        }
    }
}

/// A contour without its services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contour {
    pub id: String,
    pub application_id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContourFull {
    pub id: String,
    pub name: String,
    pub description: String,
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub project: String,
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewService {
    pub project: String,
    pub environment: String,
}

impl NewService {
    pub fn with_id(self, id: String) -> Service {
        Service {
            id,
            project: self.project,
            environment: self.environment,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameAndDescription {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddServicesRequest {
    pub services: Vec<NewService>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameConfirmation {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListApplicationsQuery {
    #[serde(default)]
    pub added: bool,
}
