//! Capability contracts for the external identity service and an HTTP client
//! that implements all of them.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use envspot_contracts::{AccessRight, ErrorKind};
use http::HeaderMap;
use http::header;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The caller's bearer token, forwarded verbatim to the identity service.
#[derive(Clone, PartialEq, Eq)]
pub struct CallerToken(String);

impl CallerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        bearer_token(headers).map(Self)
    }

    pub fn authorization_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl std::fmt::Debug for CallerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CallerToken(..)")
    }
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code {
            "ERR_AUTH_REQUIRED" | "ERR_AUTH_INVALID" => ErrorKind::Unauthenticated,
            "ERR_PERMISSION_DENIED" => ErrorKind::PermissionDenied,
            "ERR_AUTH_UNAVAILABLE" => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[async_trait]
pub trait Authorization: Send + Sync {
    async fn validate_token(&self, token: &CallerToken) -> Result<AccountId, AuthError>;

    async fn parse_id_from_token(&self, token: &CallerToken) -> Result<AccountId, AuthError>;

    /// Reachability probe used by readiness checks.
    async fn ready(&self) -> Result<(), AuthError> {
        Ok(())
    }
}

#[async_trait]
pub trait Rights: Send + Sync {
    /// Fails with `ERR_PERMISSION_DENIED` when the caller lacks `right` on the application.
    async fn check_right(
        &self,
        token: &CallerToken,
        application_id: &str,
        right: AccessRight,
    ) -> Result<(), AuthError>;

    async fn init_rights(
        &self,
        token: &CallerToken,
        account: &AccountId,
        application_id: &str,
        right: AccessRight,
    ) -> Result<(), AuthError>;

    /// Ids of every application the account is permitted to see.
    async fn list_available_apps(
        &self,
        token: &CallerToken,
        account: &AccountId,
    ) -> Result<Vec<String>, AuthError>;
}

#[async_trait]
pub trait Account: Send + Sync {
    async fn add_app_to_user(
        &self,
        token: &CallerToken,
        application_id: &str,
    ) -> Result<(), AuthError>;

    /// Ids of the applications the account added.
    async fn get_apps_from_user(
        &self,
        token: &CallerToken,
        account: &AccountId,
    ) -> Result<Vec<String>, AuthError>;
}

/// Every capability the registry consumes from the identity service.
pub trait Identity: Authorization + Rights + Account {}

impl<T> Identity for T where T: Authorization + Rights + Account {}

#[derive(Debug, Clone)]
pub struct IdentityClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct IdentityClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct AccountIdResponse {
    account_id: String,
}

#[derive(Deserialize)]
struct AccountAppsResponse {
    #[serde(default)]
    apps: Vec<String>,
}

#[derive(Deserialize)]
struct AvailableApp {
    application_id: String,
}

#[derive(Serialize)]
struct CheckRightRequest<'a> {
    application_id: &'a str,
    access_right: AccessRight,
}

#[derive(Serialize)]
struct InitRightsRequest<'a> {
    account_id: &'a str,
    application_id: &'a str,
    access_right: AccessRight,
}

#[derive(Serialize)]
struct ApplicationIdRequest<'a> {
    application_id: &'a str,
}

impl IdentityClient {
    pub fn new(config: IdentityClientConfig) -> Result<Self, AuthError> {
        if config.base_url.trim().is_empty() {
            return Err(AuthError::new(
                "ERR_INVALID_CONFIG",
                "identity base url must be non-empty",
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|_| {
                AuthError::new("ERR_INTERNAL", "failed to initialize identity http client")
            })?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        token: &CallerToken,
    ) -> Result<reqwest::Response, AuthError> {
        let response = builder
            .header(header::AUTHORIZATION, token.authorization_value())
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await
    }

    async fn account_id(&self, path: &str, token: &CallerToken) -> Result<AccountId, AuthError> {
        let response = self.send(self.http.post(self.url(path)), token).await?;
        let body = response
            .json::<AccountIdResponse>()
            .await
            .map_err(|_| AuthError::new("ERR_INTERNAL", "identity returned invalid account JSON"))?;

        let account_id = body.account_id.trim();
        if account_id.is_empty() {
            return Err(AuthError::new(
                "ERR_AUTH_INVALID",
                "identity returned an empty account id",
            ));
        }
        Ok(AccountId(account_id.to_string()))
    }
}

#[async_trait]
impl Authorization for IdentityClient {
    async fn validate_token(&self, token: &CallerToken) -> Result<AccountId, AuthError> {
        self.account_id("/v1/authorization/validate", token).await
    }

    async fn parse_id_from_token(&self, token: &CallerToken) -> Result<AccountId, AuthError> {
        self.account_id("/v1/authorization/account-id", token).await
    }

    async fn ready(&self) -> Result<(), AuthError> {
        let response = self
            .http
            .get(self.url("/healthz"))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl Rights for IdentityClient {
    async fn check_right(
        &self,
        token: &CallerToken,
        application_id: &str,
        right: AccessRight,
    ) -> Result<(), AuthError> {
        let builder = self
            .http
            .post(self.url("/v1/rights/check"))
            .json(&CheckRightRequest {
                application_id,
                access_right: right,
            });
        self.send(builder, token).await.map(|_| ())
    }

    async fn init_rights(
        &self,
        token: &CallerToken,
        account: &AccountId,
        application_id: &str,
        right: AccessRight,
    ) -> Result<(), AuthError> {
        let builder = self
            .http
            .post(self.url("/v1/rights/init"))
            .json(&InitRightsRequest {
                account_id: account.as_str(),
                application_id,
                access_right: right,
            });
        self.send(builder, token).await.map(|_| ())
    }

    async fn list_available_apps(
        &self,
        token: &CallerToken,
        account: &AccountId,
    ) -> Result<Vec<String>, AuthError> {
        let builder = self
            .http
            .get(self.url("/v1/rights/available-apps"))
            .query(&[("account_id", account.as_str())]);
        let mut response = self.send(builder, token).await?;

        let mut ids = BTreeSet::new();
        let mut pending = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            pending.extend_from_slice(&chunk);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line = pending.drain(..=pos).collect::<Vec<_>>();
                if let Some(id) = parse_available_app_line(&line)? {
                    ids.insert(id);
                }
            }
        }
        if let Some(id) = parse_available_app_line(&pending)? {
            ids.insert(id);
        }

        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl Account for IdentityClient {
    async fn add_app_to_user(
        &self,
        token: &CallerToken,
        application_id: &str,
    ) -> Result<(), AuthError> {
        let builder = self
            .http
            .post(self.url("/v1/accounts/apps"))
            .json(&ApplicationIdRequest { application_id });
        self.send(builder, token).await.map(|_| ())
    }

    async fn get_apps_from_user(
        &self,
        token: &CallerToken,
        account: &AccountId,
    ) -> Result<Vec<String>, AuthError> {
        let path = format!("/v1/accounts/{}/apps", account.as_str());
        let response = self.send(self.http.get(self.url(&path)), token).await?;
        let body = response
            .json::<AccountAppsResponse>()
            .await
            .map_err(|_| AuthError::new("ERR_INTERNAL", "identity returned invalid apps JSON"))?;

        let mut apps = body
            .apps
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        apps.sort();
        apps.dedup();
        Ok(apps)
    }
}

fn parse_available_app_line(line: &[u8]) -> Result<Option<String>, AuthError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| AuthError::new("ERR_INTERNAL", "available apps stream is not UTF-8"))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }

    let app = serde_json::from_str::<AvailableApp>(text)
        .map_err(|_| AuthError::new("ERR_INTERNAL", "available apps stream has an invalid line"))?;
    let id = app.application_id.trim();
    Ok((!id.is_empty()).then(|| id.to_string()))
}

fn transport_error(err: reqwest::Error) -> AuthError {
    if err.is_timeout() {
        AuthError::new("ERR_AUTH_UNAVAILABLE", "identity request timed out")
    } else {
        tracing::warn!(error = %err, "identity request failed");
        AuthError::new("ERR_AUTH_UNAVAILABLE", "identity request failed")
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let (code, message) = match status.as_u16() {
        401 => ("ERR_AUTH_INVALID", "token rejected by identity service"),
        403 => ("ERR_PERMISSION_DENIED", "access right denied"),
        _ => ("ERR_AUTH_UNAVAILABLE", "identity service returned non-success status"),
    };

    // Upstream bodies stay in the log; callers only see the fixed message.
    let detail = response.text().await.unwrap_or_default();
    tracing::warn!(
        status = status.as_u16(),
        code,
        detail = detail.trim(),
        "identity service returned non-success status"
    );

    Err(AuthError::new(code, message))
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::new("ERR_AUTH_REQUIRED", "missing Authorization header"))?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| {
            AuthError::new("ERR_AUTH_INVALID", "Authorization must be a Bearer token")
        })?;

    if token.trim().is_empty() {
        return Err(AuthError::new("ERR_AUTH_INVALID", "Bearer token is empty"));
    }

    Ok(token.trim().to_string())
}
