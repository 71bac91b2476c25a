use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use envspot_contracts::{Application, ApplicationFull, Contour, ContourFull, Service};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{ApplicationStore, ContourStore, RowStream, StoreError};

/// Process-local store with the same consistency rules as [`crate::PgStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    applications: BTreeMap<String, ApplicationRecord>,
    contours: BTreeMap<String, ContourRecord>,
}

struct ApplicationRecord {
    name: String,
    description: String,
    contours: Vec<String>,
}

struct ContourRecord {
    application_id: String,
    name: String,
    description: String,
    services: Vec<Service>,
}

fn app_missing(id: &str) -> StoreError {
    StoreError::not_found(format!("application with this id can't be found: {}", id))
}

fn contour_missing(id: &str) -> StoreError {
    StoreError::not_found(format!("contour with this id can't be found: {}", id))
}

impl MemoryState {
    fn app_name_taken(&self, name: &str, except: Option<&str>) -> bool {
        self.applications
            .iter()
            .any(|(id, app)| app.name == name && Some(id.as_str()) != except)
    }

    fn contour_name_taken(&self, application_id: &str, name: &str, except: Option<&str>) -> bool {
        self.contours.iter().any(|(id, contour)| {
            contour.application_id == application_id
                && contour.name == name
                && Some(id.as_str()) != except
        })
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn prefilled<T: Send + 'static>(items: Vec<T>) -> RowStream<T> {
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for item in items {
        // Capacity covers every item, so this never waits.
        let _ = tx.try_send(Ok(item));
    }
    ReceiverStream::new(rx)
}

#[async_trait]
impl ApplicationStore for InMemoryStore {
    async fn create(&self, app: &Application) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.applications.contains_key(&app.id) || state.app_name_taken(&app.name, None) {
            return Err(StoreError::already_exists(format!(
                "application with this name already exists: {}",
                app.name
            )));
        }
        state.applications.insert(
            app.id.clone(),
            ApplicationRecord {
                name: app.name.clone(),
                description: app.description.clone(),
                contours: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<ApplicationFull, StoreError> {
        let state = self.state();
        let app = state.applications.get(id).ok_or_else(|| app_missing(id))?;
        Ok(ApplicationFull {
            id: id.to_string(),
            name: app.name.clone(),
            description: app.description.clone(),
            contours: app.contours.clone(),
        })
    }

    async fn update(&self, app: &Application) -> Result<(), StoreError> {
        let mut state = self.state();
        if !state.applications.contains_key(&app.id) {
            return Err(app_missing(&app.id));
        }
        if state.app_name_taken(&app.name, Some(&app.id)) {
            return Err(StoreError::already_exists(format!(
                "application with this name already exists: {}",
                app.name
            )));
        }
        if let Some(record) = state.applications.get_mut(&app.id) {
            record.name = app.name.clone();
            record.description = app.description.clone();
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.applications.remove(id).is_none() {
            return Err(app_missing(id));
        }
        state
            .contours
            .retain(|_, contour| contour.application_id != id);
        Ok(())
    }

    fn list_added(&self, ids: Vec<String>) -> RowStream<Application> {
        self.list_by_ids(ids)
    }

    fn list_available(&self, ids: Vec<String>) -> RowStream<Application> {
        self.list_by_ids(ids)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl InMemoryStore {
    fn list_by_ids(&self, ids: Vec<String>) -> RowStream<Application> {
        let wanted: HashSet<String> = ids.into_iter().collect();
        let state = self.state();
        let rows = state
            .applications
            .iter()
            .filter(|(id, _)| wanted.contains(*id))
            .map(|(id, app)| Application {
                id: id.clone(),
                name: app.name.clone(),
                description: app.description.clone(),
            })
            .collect();
        prefilled(rows)
    }
}

#[async_trait]
impl ContourStore for InMemoryStore {
    async fn create(&self, contour: &Contour) -> Result<(), StoreError> {
        let mut state = self.state();
        if !state.applications.contains_key(&contour.application_id) {
            return Err(app_missing(&contour.application_id));
        }
        if state.contours.contains_key(&contour.id)
            || state.contour_name_taken(&contour.application_id, &contour.name, None)
        {
            return Err(StoreError::already_exists(format!(
                "contour with this name already exists in application {}: {}",
                contour.application_id, contour.name
            )));
        }

        state.contours.insert(
            contour.id.clone(),
            ContourRecord {
                application_id: contour.application_id.clone(),
                name: contour.name.clone(),
                description: contour.description.clone(),
                services: Vec::new(),
            },
        );
        if let Some(app) = state.applications.get_mut(&contour.application_id) {
            app.contours.push(contour.id.clone());
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<ContourFull, StoreError> {
        let state = self.state();
        let contour = state.contours.get(id).ok_or_else(|| contour_missing(id))?;
        Ok(ContourFull {
            id: id.to_string(),
            name: contour.name.clone(),
            description: contour.description.clone(),
            services: contour.services.clone(),
        })
    }

    async fn update(&self, contour: &Contour) -> Result<(), StoreError> {
        let mut state = self.state();
        let application_id = state
            .contours
            .get(&contour.id)
            .map(|c| c.application_id.clone())
            .ok_or_else(|| contour_missing(&contour.id))?;
        if state.contour_name_taken(&application_id, &contour.name, Some(&contour.id)) {
            return Err(StoreError::already_exists(format!(
                "contour with this name already exists in application {}: {}",
                application_id, contour.name
            )));
        }
        if let Some(record) = state.contours.get_mut(&contour.id) {
            record.name = contour.name.clone();
            record.description = contour.description.clone();
        }
        Ok(())
    }

    fn list(&self, application_id: String) -> RowStream<ContourFull> {
        let state = self.state();
        let rows = state
            .applications
            .get(&application_id)
            .map(|app| {
                app.contours
                    .iter()
                    .filter_map(|id| {
                        state.contours.get(id).map(|c| ContourFull {
                            id: id.clone(),
                            name: c.name.clone(),
                            description: c.description.clone(),
                            services: c.services.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        prefilled(rows)
    }

    async fn delete(&self, id: &str, application_id: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        let owned = state
            .contours
            .get(id)
            .is_some_and(|c| c.application_id == application_id)
            && state
                .applications
                .get(application_id)
                .is_some_and(|app| app.contours.iter().any(|c| c == id));
        if !owned {
            return Err(StoreError::not_found(format!(
                "contour with this id ({}) doesn't belong to the application {}",
                id, application_id
            )));
        }

        state.contours.remove(id);
        if let Some(app) = state.applications.get_mut(application_id) {
            app.contours.retain(|c| c != id);
        }
        Ok(())
    }

    async fn add_services(&self, contour_id: &str, services: &[Service]) -> Result<(), StoreError> {
        let mut state = self.state();
        let contour = state
            .contours
            .get_mut(contour_id)
            .ok_or_else(|| contour_missing(contour_id))?;
        contour.services.extend_from_slice(services);
        Ok(())
    }

    async fn remove_service(&self, contour_id: &str, service_id: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        let contour = state
            .contours
            .get_mut(contour_id)
            .ok_or_else(|| contour_missing(contour_id))?;
        contour.services.retain(|s| s.id != service_id);
        Ok(())
    }

    async fn get_app_id_by_contour_id(&self, contour_id: &str) -> Result<String, StoreError> {
        let state = self.state();
        state
            .contours
            .get(contour_id)
            .map(|c| c.application_id.clone())
            .ok_or_else(|| contour_missing(contour_id))
    }
}
