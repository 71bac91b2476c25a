use async_trait::async_trait;
use envspot_contracts::{Application, ApplicationFull, Contour, ContourFull, Service};
use tokio_stream::wrappers::ReceiverStream;

mod error;
mod memory;
mod postgres;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use postgres::{PgStore, PgStoreOptions};

// A storage failure is always the last item.
pub type RowStream<T> = ReceiverStream<Result<T, StoreError>>;

#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn create(&self, app: &Application) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<ApplicationFull, StoreError>;

    async fn update(&self, app: &Application) -> Result<(), StoreError>;

    // Cascades to the application's contours.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    fn list_added(&self, ids: Vec<String>) -> RowStream<Application>;

    fn list_available(&self, ids: Vec<String>) -> RowStream<Application>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ContourStore: Send + Sync {
    /// Inserts the contour and appends its id to the parent's `contours` list atomically.
    async fn create(&self, contour: &Contour) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<ContourFull, StoreError>;

    async fn update(&self, contour: &Contour) -> Result<(), StoreError>;

    fn list(&self, application_id: String) -> RowStream<ContourFull>;

    async fn delete(&self, id: &str, application_id: &str) -> Result<(), StoreError>;

    async fn add_services(&self, contour_id: &str, services: &[Service]) -> Result<(), StoreError>;

    // Removing an absent id is a no-op.
    async fn remove_service(&self, contour_id: &str, service_id: &str) -> Result<(), StoreError>;

    async fn get_app_id_by_contour_id(&self, contour_id: &str) -> Result<String, StoreError>;
}
