use envspot_auth::{AuthError, CallerToken};
use envspot_contracts::{AccessRight, Application, ApplicationFull, ErrorKind, NameAndDescription};
use envspot_store::RowStream;

use super::{RegistryService, ServiceError, new_id, required_name, store_failure};

/// Identity-side steps that follow the store insert when an application is created.
/// Each one is undone by deleting the freshly inserted application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateStep {
    ResolveAccount,
    InitRights,
    LinkAccount,
}

impl CreateStep {
    fn as_str(self) -> &'static str {
        match self {
            CreateStep::ResolveAccount => "resolve_account",
            CreateStep::InitRights => "init_rights",
            CreateStep::LinkAccount => "link_account",
        }
    }
}

impl RegistryService {
    // The saga runs on its own task so a dropped request cannot skip compensation.
    pub async fn create_application(
        &self,
        token: &CallerToken,
        req: NameAndDescription,
    ) -> Result<Application, ServiceError> {
        self.authenticate(token).await?;
        let app = Application {
            id: new_id(),
            name: required_name(&req.name, "application")?,
            description: req.description,
        };

        let service = self.clone();
        let token = token.clone();
        tokio::spawn(async move { service.run_create_saga(&token, app).await })
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "application create task failed");
                ServiceError::new(ErrorKind::Internal, "application create failed")
            })?
    }

    async fn run_create_saga(
        &self,
        token: &CallerToken,
        app: Application,
    ) -> Result<Application, ServiceError> {
        self.applications
            .create(&app)
            .await
            .map_err(store_failure("applications.create"))?;

        if let Err((step, err)) = self.register_with_identity(token, &app.id).await {
            self.compensate_create(&app.id, step, &err).await;
            return Err(err.into());
        }

        tracing::info!(application_id = %app.id, "application created");
        Ok(app)
    }

    async fn register_with_identity(
        &self,
        token: &CallerToken,
        application_id: &str,
    ) -> Result<(), (CreateStep, AuthError)> {
        let account = self
            .identity
            .parse_id_from_token(token)
            .await
            .map_err(|err| (CreateStep::ResolveAccount, err))?;
        self.identity
            .init_rights(token, &account, application_id, AccessRight::Delete)
            .await
            .map_err(|err| (CreateStep::InitRights, err))?;
        self.identity
            .add_app_to_user(token, application_id)
            .await
            .map_err(|err| (CreateStep::LinkAccount, err))?;
        Ok(())
    }

    async fn compensate_create(&self, application_id: &str, step: CreateStep, cause: &AuthError) {
        match self.applications.delete(application_id).await {
            Ok(()) => {
                crate::metrics::inc_compensation(true);
                tracing::warn!(
                    application_id,
                    failed_step = step.as_str(),
                    cause = %cause,
                    "application create rolled back"
                );
            }
            Err(err) => {
                crate::metrics::inc_compensation(false);
                tracing::error!(
                    event = "reconciliation_required",
                    application_id,
                    failed_step = step.as_str(),
                    cause = %cause,
                    error = %err,
                    "compensating delete failed; application left without rights or owner"
                );
            }
        }
    }

    pub async fn get_application(
        &self,
        token: &CallerToken,
        id: &str,
    ) -> Result<ApplicationFull, ServiceError> {
        self.authorize(token, id, AccessRight::Read).await?;
        self.applications
            .get(id)
            .await
            .map_err(store_failure("applications.get"))
    }

    pub async fn update_application(
        &self,
        token: &CallerToken,
        id: &str,
        req: NameAndDescription,
    ) -> Result<Application, ServiceError> {
        self.authorize(token, id, AccessRight::Write).await?;
        let app = Application {
            id: id.to_string(),
            name: required_name(&req.name, "application")?,
            description: req.description,
        };
        self.applications
            .update(&app)
            .await
            .map_err(store_failure("applications.update"))?;
        Ok(app)
    }

    pub async fn delete_application(
        &self,
        token: &CallerToken,
        id: &str,
        name: &str,
    ) -> Result<(), ServiceError> {
        self.authorize(token, id, AccessRight::Delete).await?;
        let stored = self
            .applications
            .get(id)
            .await
            .map_err(store_failure("applications.get"))?;
        if stored.name != name.trim() {
            return Err(ServiceError::new(
                ErrorKind::Aborted,
                format!("application name does not match for id {}", id),
            ));
        }

        self.applications
            .delete(id)
            .await
            .map_err(store_failure("applications.delete"))?;
        tracing::info!(application_id = id, "application deleted");
        Ok(())
    }

    pub async fn list_applications(
        &self,
        token: &CallerToken,
        added: bool,
    ) -> Result<RowStream<Application>, ServiceError> {
        let account = self.authenticate(token).await?;
        if added {
            let ids = self.identity.get_apps_from_user(token, &account).await?;
            Ok(self.applications.list_added(ids))
        } else {
            let ids = self.identity.list_available_apps(token, &account).await?;
            Ok(self.applications.list_available(ids))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use envspot_contracts::Contour;
    use envspot_store::{ApplicationStore, InMemoryStore, StoreError};
    use tokio_stream::StreamExt;

    use super::*;
    use crate::service::testing::{self, FakeIdentity};

    fn named(name: &str) -> NameAndDescription {
        NameAndDescription {
            name: name.to_string(),
            description: "desc".to_string(),
        }
    }

    #[tokio::test]
    async fn create_registers_rights_and_account_link() {
        let (service, _store, identity) = testing::service();
        let token = testing::token();

        let app = service
            .create_application(&token, named("  payments "))
            .await
            .expect("create should succeed");
        assert_eq!(app.name, "payments");
        assert_eq!(app.id.len(), 26);

        {
            let state = identity.state.lock().unwrap();
            assert_eq!(state.rights.get(&app.id), Some(&AccessRight::Delete));
            assert!(state.added.contains(&app.id));
        }

        let full = service.get_application(&token, &app.id).await.unwrap();
        assert_eq!(full.name, "payments");
        assert_eq!(full.description, "desc");
        assert!(full.contours.is_empty());
    }

    #[tokio::test]
    async fn failed_rights_init_removes_the_application() {
        let (service, _store, identity) = testing::service();
        identity.state.lock().unwrap().fail_init_rights = true;

        let err = service
            .create_application(&testing::token(), named("payments"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(identity.state.lock().unwrap().added.is_empty());

        // The name is free again because nothing was left behind.
        identity.state.lock().unwrap().fail_init_rights = false;
        service
            .create_application(&testing::token(), named("payments"))
            .await
            .expect("retry should succeed");
    }

    #[tokio::test]
    async fn failed_account_link_removes_the_application() {
        let (service, _store, identity) = testing::service();
        identity.state.lock().unwrap().fail_add_app = true;

        service
            .create_application(&testing::token(), named("payments"))
            .await
            .unwrap_err();

        identity.state.lock().unwrap().fail_add_app = false;
        service
            .create_application(&testing::token(), named("payments"))
            .await
            .expect("name should be reusable after rollback");
    }

    /// Delegates to an in-memory store but refuses every delete.
    struct UndeletableStore(InMemoryStore);

    #[async_trait]
    impl ApplicationStore for UndeletableStore {
        async fn create(&self, app: &Application) -> Result<(), StoreError> {
            ApplicationStore::create(&self.0, app).await
        }

        async fn get(&self, id: &str) -> Result<ApplicationFull, StoreError> {
            ApplicationStore::get(&self.0, id).await
        }

        async fn update(&self, app: &Application) -> Result<(), StoreError> {
            ApplicationStore::update(&self.0, app).await
        }

        async fn delete(&self, _id: &str) -> Result<(), StoreError> {
            Err(StoreError::new(ErrorKind::Internal, "applications.delete failed"))
        }

        fn list_added(&self, ids: Vec<String>) -> RowStream<Application> {
            self.0.list_added(ids)
        }

        fn list_available(&self, ids: Vec<String>) -> RowStream<Application> {
            self.0.list_available(ids)
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_compensation_still_reports_original_error() {
        let store = InMemoryStore::new();
        let identity = Arc::new(FakeIdentity::default());
        identity.state.lock().unwrap().fail_add_app = true;
        let service = RegistryService::new(
            Arc::new(UndeletableStore(store.clone())),
            Arc::new(store.clone()),
            identity,
        );

        let err = service
            .create_application(&testing::token(), named("payments"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert_eq!(err.message, "account service down");
    }

    #[tokio::test]
    async fn delete_with_wrong_name_is_aborted_and_keeps_row() {
        let (service, _store, _identity) = testing::service();
        let token = testing::token();
        let app = service
            .create_application(&token, named("payments"))
            .await
            .unwrap();

        let err = service
            .delete_application(&token, &app.id, "billing")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Aborted);
        assert!(service.get_application(&token, &app.id).await.is_ok());

        service
            .delete_application(&token, &app.id, "payments")
            .await
            .expect("matching name deletes");
    }

    #[tokio::test]
    async fn delete_cascades_to_contours() {
        let (service, store, _identity) = testing::service();
        let token = testing::token();
        let app = service
            .create_application(&token, named("payments"))
            .await
            .unwrap();
        envspot_store::ContourStore::create(
            &store,
            &Contour {
                id: "C1".to_string(),
                application_id: app.id.clone(),
                name: "dev".to_string(),
                description: String::new(),
            },
        )
        .await
        .unwrap();

        service
            .delete_application(&token, &app.id, "payments")
            .await
            .unwrap();
        let err = envspot_store::ContourStore::get(&store, "C1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn empty_name_is_rejected_before_any_write() {
        let (service, _store, identity) = testing::service();
        let err = service
            .create_application(&testing::token(), named("   "))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(identity.state.lock().unwrap().rights.is_empty());
    }

    #[tokio::test]
    async fn operations_require_a_valid_token_and_right() {
        let (service, _store, identity) = testing::service();
        let token = testing::token();
        let app = service
            .create_application(&token, named("payments"))
            .await
            .unwrap();

        let err = service
            .get_application(&CallerToken::new("forged"), &app.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);

        identity.grant(&app.id, AccessRight::Read);
        let err = service
            .update_application(&token, &app.id, named("renamed"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn list_switches_between_added_and_available() {
        let (service, store, identity) = testing::service();
        let token = testing::token();
        let mine = service
            .create_application(&token, named("payments"))
            .await
            .unwrap();
        ApplicationStore::create(
            &store,
            &Application {
                id: "SHARED".to_string(),
                name: "shared".to_string(),
                description: String::new(),
            },
        )
        .await
        .unwrap();
        identity.grant("SHARED", AccessRight::Read);

        let added: Vec<String> = service
            .list_applications(&token, true)
            .await
            .unwrap()
            .map(|row| row.unwrap().id)
            .collect()
            .await;
        assert_eq!(added, vec![mine.id.clone()]);

        let mut available: Vec<String> = service
            .list_applications(&token, false)
            .await
            .unwrap()
            .map(|row| row.unwrap().id)
            .collect()
            .await;
        available.sort();
        let mut expected = vec![mine.id, "SHARED".to_string()];
        expected.sort();
        assert_eq!(available, expected);
    }
}
