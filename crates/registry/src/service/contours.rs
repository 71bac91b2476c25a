use envspot_auth::CallerToken;
use envspot_contracts::{
    AccessRight, Contour, ContourFull, ErrorKind, NameAndDescription, NewService,
};
use envspot_store::RowStream;

use super::{RegistryService, ServiceError, new_id, required_name, store_failure};

impl RegistryService {
    /// Checks `right` on the application that owns the contour and returns its id.
    async fn authorize_contour(
        &self,
        token: &CallerToken,
        contour_id: &str,
        right: AccessRight,
    ) -> Result<String, ServiceError> {
        self.authenticate(token).await?;
        let application_id = self
            .contours
            .get_app_id_by_contour_id(contour_id)
            .await
            .map_err(store_failure("contours.get_app_id"))?;
        self.check_right(token, &application_id, right).await?;
        Ok(application_id)
    }

    pub async fn create_contour(
        &self,
        token: &CallerToken,
        application_id: &str,
        req: NameAndDescription,
    ) -> Result<Contour, ServiceError> {
        self.authorize(token, application_id, AccessRight::Write)
            .await?;
        let contour = Contour {
            id: new_id(),
            application_id: application_id.to_string(),
            name: required_name(&req.name, "contour")?,
            description: req.description,
        };
        self.contours
            .create(&contour)
            .await
            .map_err(store_failure("contours.create"))?;
        tracing::info!(
            application_id,
            contour_id = %contour.id,
            "contour created"
        );
        Ok(contour)
    }

    pub async fn get_contour(
        &self,
        token: &CallerToken,
        id: &str,
    ) -> Result<ContourFull, ServiceError> {
        self.authorize_contour(token, id, AccessRight::Read)
            .await?;
        self.contours
            .get(id)
            .await
            .map_err(store_failure("contours.get"))
    }

    pub async fn update_contour(
        &self,
        token: &CallerToken,
        id: &str,
        req: NameAndDescription,
    ) -> Result<Contour, ServiceError> {
        let application_id = self
            .authorize_contour(token, id, AccessRight::Write)
            .await?;
        let contour = Contour {
            id: id.to_string(),
            application_id,
            name: required_name(&req.name, "contour")?,
            description: req.description,
        };
        self.contours
            .update(&contour)
            .await
            .map_err(store_failure("contours.update"))?;
        Ok(contour)
    }

    pub async fn delete_contour(
        &self,
        token: &CallerToken,
        application_id: &str,
        id: &str,
        name: &str,
    ) -> Result<(), ServiceError> {
        self.authorize(token, application_id, AccessRight::Write)
            .await?;
        let owner = self
            .contours
            .get_app_id_by_contour_id(id)
            .await
            .map_err(store_failure("contours.get_app_id"))?;
        if owner != application_id {
            return Err(ServiceError::new(
                ErrorKind::NotFound,
                format!(
                    "contour with this id ({}) doesn't belong to the application {}",
                    id, application_id
                ),
            ));
        }

        let stored = self
            .contours
            .get(id)
            .await
            .map_err(store_failure("contours.get"))?;
        if stored.name != name.trim() {
            return Err(ServiceError::new(
                ErrorKind::Aborted,
                format!("contour name does not match for id {}", id),
            ));
        }

        self.contours
            .delete(id, application_id)
            .await
            .map_err(store_failure("contours.delete"))?;
        tracing::info!(application_id, contour_id = id, "contour deleted");
        Ok(())
    }

    pub async fn list_contours(
        &self,
        token: &CallerToken,
        application_id: &str,
    ) -> Result<RowStream<ContourFull>, ServiceError> {
        self.authorize(token, application_id, AccessRight::Read)
            .await?;
        Ok(self.contours.list(application_id.to_string()))
    }

    pub async fn add_services(
        &self,
        token: &CallerToken,
        contour_id: &str,
        services: Vec<NewService>,
    ) -> Result<(), ServiceError> {
        if services.is_empty() {
            return Err(ServiceError::invalid_argument(
                "services must contain at least one entry",
            ));
        }
        self.authorize_contour(token, contour_id, AccessRight::Write)
            .await?;

        let services: Vec<_> = services
            .into_iter()
            .map(|service| service.with_id(new_id()))
            .collect();
        self.contours
            .add_services(contour_id, &services)
            .await
            .map_err(store_failure("contours.add_services"))
    }

    pub async fn remove_service(
        &self,
        token: &CallerToken,
        contour_id: &str,
        service_id: &str,
    ) -> Result<(), ServiceError> {
        self.authorize_contour(token, contour_id, AccessRight::Write)
            .await?;
        self.contours
            .remove_service(contour_id, service_id)
            .await
            .map_err(store_failure("contours.remove_service"))
    }
}
