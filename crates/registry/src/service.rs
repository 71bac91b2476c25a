use std::sync::Arc;

use envspot_auth::{AccountId, AuthError, CallerToken, Identity};
use envspot_contracts::{AccessRight, ErrorKind};
use envspot_store::{ApplicationStore, ContourStore, StoreError};

mod applications;
mod contours;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        Self::new(err.kind, err.message)
    }
}

impl From<AuthError> for ServiceError {
    fn from(err: AuthError) -> Self {
        Self::new(err.kind(), err.message)
    }
}

fn store_failure(operation: &'static str) -> impl Fn(StoreError) -> ServiceError {
    move |err| {
        crate::metrics::inc_store_error(operation, err.kind.as_str());
        err.into()
    }
}

fn required_name(raw: &str, what: &str) -> Result<String, ServiceError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ServiceError::invalid_argument(format!(
            "{} name must not be empty",
            what
        )));
    }
    Ok(name.to_string())
}

fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

#[derive(Clone)]
pub struct RegistryService {
    applications: Arc<dyn ApplicationStore>,
    contours: Arc<dyn ContourStore>,
    identity: Arc<dyn Identity>,
}

impl RegistryService {
    pub fn new(
        applications: Arc<dyn ApplicationStore>,
        contours: Arc<dyn ContourStore>,
        identity: Arc<dyn Identity>,
    ) -> Self {
        Self {
            applications,
            contours,
            identity,
        }
    }

    pub async fn store_ready(&self) -> bool {
        self.applications.ping().await.is_ok()
    }

    pub async fn identity_ready(&self) -> bool {
        self.identity.ready().await.is_ok()
    }

    async fn authenticate(&self, token: &CallerToken) -> Result<AccountId, ServiceError> {
        Ok(self.identity.validate_token(token).await?)
    }

    async fn authorize(
        &self,
        token: &CallerToken,
        application_id: &str,
        right: AccessRight,
    ) -> Result<(), ServiceError> {
        self.authenticate(token).await?;
        self.check_right(token, application_id, right).await
    }

    async fn check_right(
        &self,
        token: &CallerToken,
        application_id: &str,
        right: AccessRight,
    ) -> Result<(), ServiceError> {
        self.identity
            .check_right(token, application_id, right)
            .await
            .map_err(|err| {
                tracing::debug!(
                    application_id,
                    access_right = right.as_str(),
                    code = err.code,
                    "access right check failed"
                );
                ServiceError::from(err)
            })
    }
}
