//! relaybus-standalone: single-process demo host
//!
//! Runs the bus against SQLite and the in-process broker. A catalog service
//! creates a category and publishes `CategoryCreated` in the same
//! transaction; a projection handler in the same process receives it.
//!
//! ## Architecture
//! ```text
//! create_category ──(one transaction)──> categories + outbox
//!                                             │
//!                                        OutboxRelay
//!                                             │
//!                                     in-process broker
//!                                             │
//!                             Dispatcher + inbox ──> projection handler
//! ```
//!
//! ## Configuration
//! - RELAYBUS_CONFIG: Path to a YAML config file (optional)
//! - RELAYBUS_LOG: Log filter (default: info)
//! - RELAYBUS_STORAGE__URL: SQLite path (default: data/relaybus.db)

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use relaybus::config::{Config, MessagingType, StorageType};
use relaybus::storage::sql::sqlite::Sqlite;
use relaybus::utils::bootstrap::{init_tracing, shutdown_signal};
use relaybus::{
    BusRuntime, FnHandler, HandlerError, HandlerId, IntegrationPayload, ReceivedEvent, UnitOfWork,
};

const PROJECTION_HANDLER: &str = "category-projection";

const CATEGORIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL
)"#;

#[derive(Debug, Serialize, Deserialize)]
struct CategoryCreated {
    id: String,
    name: String,
}

impl IntegrationPayload for CategoryCreated {
    const EVENT_NAME: &'static str = "CategoryCreated";
}

/// Insert the category and stage its event in one unit of work.
async fn create_category(
    runtime: &BusRuntime<Sqlite>,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let category = CategoryCreated {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
    };

    let mut uow: UnitOfWork<Sqlite> = runtime.begin().await?;
    sqlx::query("INSERT INTO categories (id, name) VALUES (?, ?)")
        .bind(&category.id)
        .bind(&category.name)
        .execute(&mut **uow.transaction())
        .await?;
    let event_id = runtime
        .bus()
        .publish(&mut uow, CategoryCreated::EVENT_NAME, &category)?;
    uow.commit().await?;

    info!(event_id = %event_id, category = %category.id, "Category created");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    if config.storage.storage_type != StorageType::Sqlite
        || config.messaging.messaging_type != MessagingType::Channel
    {
        return Err("relaybus-standalone supports sqlite storage with channel messaging".into());
    }

    let mut runtime = BusRuntime::<Sqlite>::from_config(config).await?;
    sqlx::query(CATEGORIES_TABLE)
        .execute(runtime.pool())
        .await?;

    let handler = FnHandler::new(|category: CategoryCreated, event: Arc<ReceivedEvent>| async move {
        info!(
            event_id = %event.id,
            delivery = event.delivery_count,
            category = %category.id,
            name = %category.name,
            "Projected category"
        );
        Ok::<(), HandlerError>(())
    });
    let handler_id = HandlerId::new(PROJECTION_HANDLER);
    runtime
        .bus()
        .register_handler(handler_id.clone(), Arc::new(handler))?;
    runtime
        .bus()
        .subscribe(CategoryCreated::EVENT_NAME, &handler_id)
        .await?;

    runtime.start().await?;
    create_category(&runtime, "Podcasts").await?;

    info!("relaybus-standalone running, press Ctrl-C to stop");
    shutdown_signal().await;

    runtime.shutdown().await;
    Ok(())
}
