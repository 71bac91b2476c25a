use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use envspot_contracts::{
    Application, ApplicationFull, Contour, ContourFull, ErrorKind, Service,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Subject, translate};
use crate::{ApplicationStore, ContourStore, RowStream, StoreError};

const LIST_APPLICATIONS_SQL: &str =
    "SELECT id, name, description FROM applications WHERE id = ANY($1)";

const LIST_CONTOURS_SQL: &str = "SELECT c.id, c.name, c.description, c.services \
     FROM contours c JOIN applications a ON c.id = ANY(a.contours) \
     WHERE a.id = $1";

const REMOVE_SERVICE_SQL: &str = "UPDATE contours SET services = (\
         SELECT COALESCE(jsonb_agg(e.elem ORDER BY e.ord), '[]'::jsonb) \
         FROM jsonb_array_elements(COALESCE(contours.services, '[]'::jsonb)) \
              WITH ORDINALITY AS e(elem, ord) \
         WHERE e.elem->>'id' IS DISTINCT FROM $2\
     ) WHERE id = $1";

#[derive(Debug, Clone)]
pub struct PgStoreOptions {
    pub max_connections: u32,
    pub query_timeout: Duration,
    pub list_buffer: usize,
}

impl Default for PgStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            query_timeout: Duration::from_secs(2),
            list_buffer: 16,
        }
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    query_timeout: Duration,
    list_buffer: usize,
}

#[derive(FromRow)]
struct ApplicationRow {
    id: String,
    name: String,
    description: String,
}

impl From<ApplicationRow> for Application {
    fn from(row: ApplicationRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
        }
    }
}

#[derive(FromRow)]
struct ApplicationFullRow {
    id: String,
    name: String,
    description: String,
    contours: Vec<String>,
}

#[derive(FromRow)]
struct ContourRow {
    id: String,
    name: String,
    description: String,
    services: Json<Vec<Service>>,
}

impl From<ContourRow> for ContourFull {
    fn from(row: ContourRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            services: row.services.0,
        }
    }
}

impl PgStore {
    pub async fn connect(db_url: &str, options: PgStoreOptions) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new()
                .max_connections(options.max_connections.max(1))
                .connect(db_url),
        )
        .await
        .map_err(|_| StoreError::timeout("store.connect"))?
        .map_err(|err| {
            tracing::warn!(error = %err, "database connect failed");
            StoreError::new(ErrorKind::Unavailable, "database unavailable")
        })?;

        Ok(Self::from_pool(pool, options))
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        options: PgStoreOptions,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, options).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool, options: PgStoreOptions) -> Self {
        Self {
            pool,
            query_timeout: options.query_timeout,
            list_buffer: options.list_buffer.max(1),
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), run_migrations(&self.pool))
            .await
            .map_err(|_| StoreError::timeout("store.migrate"))?
            .map_err(|err| {
                tracing::error!(error = %err, "schema migration failed");
                StoreError::new(ErrorKind::Internal, "store.migrate failed")
            })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| StoreError::timeout(operation))?
    }

    fn stream_applications(&self, operation: &'static str, ids: Vec<String>) -> RowStream<Application> {
        let (tx, rx) = mpsc::channel(self.list_buffer);
        if ids.is_empty() {
            return ReceiverStream::new(rx);
        }

        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut rows = sqlx::query_as::<_, ApplicationRow>(LIST_APPLICATIONS_SQL)
                .bind(&ids[..])
                .fetch(&pool);

            while let Some(row) = rows.next().await {
                let item = row
                    .map(Application::from)
                    .map_err(|err| translate(operation, Subject::ApplicationId("-"), err));
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    tracing::debug!(operation, "list receiver closed; stopping cursor");
                    return;
                }
                if failed {
                    return;
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[async_trait]
impl ApplicationStore for PgStore {
    async fn create(&self, app: &Application) -> Result<(), StoreError> {
        const OP: &str = "applications.create";
        let subject = Subject::Application {
            id: &app.id,
            name: &app.name,
        };
        self.bounded(OP, async {
            sqlx::query("INSERT INTO applications (id, name, description) VALUES ($1, $2, $3)")
                .bind(&app.id)
                .bind(&app.name)
                .bind(&app.description)
                .execute(&self.pool)
                .await
                .map_err(|err| translate(OP, subject, err))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<ApplicationFull, StoreError> {
        const OP: &str = "applications.get";
        self.bounded(OP, async {
            let row = sqlx::query_as::<_, ApplicationFullRow>(
                "SELECT id, name, description, contours FROM applications WHERE id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| translate(OP, Subject::ApplicationId(id), err))?;

            Ok(ApplicationFull {
                id: row.id,
                name: row.name,
                description: row.description,
                contours: row.contours,
            })
        })
        .await
    }

    async fn update(&self, app: &Application) -> Result<(), StoreError> {
        const OP: &str = "applications.update";
        let subject = Subject::Application {
            id: &app.id,
            name: &app.name,
        };
        self.bounded(OP, async {
            let result =
                sqlx::query("UPDATE applications SET name = $2, description = $3 WHERE id = $1")
                    .bind(&app.id)
                    .bind(&app.name)
                    .bind(&app.description)
                    .execute(&self.pool)
                    .await
                    .map_err(|err| translate(OP, subject, err))?;

            if result.rows_affected() == 0 {
                return Err(translate(OP, subject, sqlx::Error::RowNotFound));
            }
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        const OP: &str = "applications.delete";
        self.bounded(OP, async {
            let result = sqlx::query("DELETE FROM applications WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|err| translate(OP, Subject::ApplicationId(id), err))?;

            if result.rows_affected() == 0 {
                return Err(translate(OP, Subject::ApplicationId(id), sqlx::Error::RowNotFound));
            }
            Ok(())
        })
        .await
    }

    fn list_added(&self, ids: Vec<String>) -> RowStream<Application> {
        self.stream_applications("applications.list_added", ids)
    }

    fn list_available(&self, ids: Vec<String>) -> RowStream<Application> {
        self.stream_applications("applications.list_available", ids)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        const OP: &str = "store.ping";
        self.bounded(OP, async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|err| translate(OP, Subject::ApplicationId("-"), err))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ContourStore for PgStore {
    async fn create(&self, contour: &Contour) -> Result<(), StoreError> {
        const OP: &str = "contours.create";
        let subject = Subject::Contour {
            id: &contour.id,
            application_id: &contour.application_id,
            name: &contour.name,
        };
        self.bounded(OP, async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| translate(OP, subject, err))?;

            sqlx::query(
                "INSERT INTO contours (id, application_id, name, description) VALUES ($1, $2, $3, $4)",
            )
            .bind(&contour.id)
            .bind(&contour.application_id)
            .bind(&contour.name)
            .bind(&contour.description)
            .execute(&mut *tx)
            .await
            .map_err(|err| translate(OP, subject, err))?;

            let paired = sqlx::query(
                "UPDATE applications SET contours = array_append(contours, $1) WHERE id = $2",
            )
            .bind(&contour.id)
            .bind(&contour.application_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| translate(OP, subject, err))?;

            if paired.rows_affected() == 0 {
                return Err(translate(
                    OP,
                    Subject::ApplicationId(&contour.application_id),
                    sqlx::Error::RowNotFound,
                ));
            }

            tx.commit()
                .await
                .map_err(|err| translate(OP, subject, err))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<ContourFull, StoreError> {
        const OP: &str = "contours.get";
        self.bounded(OP, async {
            let row = sqlx::query_as::<_, ContourRow>(
                "SELECT id, name, description, services FROM contours WHERE id = $1",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| translate(OP, Subject::ContourId(id), err))?;
            Ok(row.into())
        })
        .await
    }

    async fn update(&self, contour: &Contour) -> Result<(), StoreError> {
        const OP: &str = "contours.update";
        let subject = Subject::Contour {
            id: &contour.id,
            application_id: &contour.application_id,
            name: &contour.name,
        };
        self.bounded(OP, async {
            let result =
                sqlx::query("UPDATE contours SET name = $2, description = $3 WHERE id = $1")
                    .bind(&contour.id)
                    .bind(&contour.name)
                    .bind(&contour.description)
                    .execute(&self.pool)
                    .await
                    .map_err(|err| translate(OP, subject, err))?;

            if result.rows_affected() == 0 {
                return Err(translate(OP, subject, sqlx::Error::RowNotFound));
            }
            Ok(())
        })
        .await
    }

    fn list(&self, application_id: String) -> RowStream<ContourFull> {
        const OP: &str = "contours.list";
        let (tx, rx) = mpsc::channel(self.list_buffer);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let mut rows = sqlx::query_as::<_, ContourRow>(LIST_CONTOURS_SQL)
                .bind(&application_id)
                .fetch(&pool);

            while let Some(row) = rows.next().await {
                let item = row
                    .map(ContourFull::from)
                    .map_err(|err| translate(OP, Subject::ApplicationId(&application_id), err));
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    tracing::debug!(operation = OP, "list receiver closed; stopping cursor");
                    return;
                }
                if failed {
                    return;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    async fn delete(&self, id: &str, application_id: &str) -> Result<(), StoreError> {
        const OP: &str = "contours.delete";
        let subject = Subject::ContourId(id);
        self.bounded(OP, async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| translate(OP, subject, err))?;

            let deleted = sqlx::query(
                "DELETE FROM contours c USING applications a \
                 WHERE c.id = $1 AND a.id = $2 AND c.application_id = a.id AND c.id = ANY(a.contours)",
            )
            .bind(id)
            .bind(application_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| translate(OP, subject, err))?;

            if deleted.rows_affected() == 0 {
                return Err(StoreError::not_found(format!(
                    "contour with this id ({}) doesn't belong to the application {}",
                    id, application_id
                )));
            }

            sqlx::query("UPDATE applications SET contours = array_remove(contours, $1) WHERE id = $2")
                .bind(id)
                .bind(application_id)
                .execute(&mut *tx)
                .await
                .map_err(|err| translate(OP, subject, err))?;

            tx.commit()
                .await
                .map_err(|err| translate(OP, subject, err))?;
            Ok(())
        })
        .await
    }

    async fn add_services(&self, contour_id: &str, services: &[Service]) -> Result<(), StoreError> {
        const OP: &str = "contours.add_services";
        let subject = Subject::ContourId(contour_id);
        self.bounded(OP, async {
            let result = sqlx::query(
                "UPDATE contours SET services = COALESCE(services, '[]'::jsonb) || $2 WHERE id = $1",
            )
            .bind(contour_id)
            .bind(Json(services))
            .execute(&self.pool)
            .await
            .map_err(|err| translate(OP, subject, err))?;

            if result.rows_affected() == 0 {
                return Err(translate(OP, subject, sqlx::Error::RowNotFound));
            }
            Ok(())
        })
        .await
    }

    async fn remove_service(&self, contour_id: &str, service_id: &str) -> Result<(), StoreError> {
        const OP: &str = "contours.remove_service";
        let subject = Subject::ContourId(contour_id);
        self.bounded(OP, async {
            let result = sqlx::query(REMOVE_SERVICE_SQL)
                .bind(contour_id)
                .bind(service_id)
                .execute(&self.pool)
                .await
                .map_err(|err| translate(OP, subject, err))?;

            if result.rows_affected() == 0 {
                return Err(translate(OP, subject, sqlx::Error::RowNotFound));
            }
            Ok(())
        })
        .await
    }

    async fn get_app_id_by_contour_id(&self, contour_id: &str) -> Result<String, StoreError> {
        const OP: &str = "contours.get_app_id";
        self.bounded(OP, async {
            sqlx::query_scalar::<_, String>("SELECT application_id FROM contours WHERE id = $1")
                .bind(contour_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|err| translate(OP, Subject::ContourId(contour_id), err))
        })
        .await
    }
}
