//! Persistent route storage
//!
//! The store is the authority for route definitions. In-memory tables on
//! every gateway node are rebuilt from it on reload.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::lock_utils::lock_or_recover;
use crate::route::RouteDefinition;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unique constraint violated for route id: {0}")]
    UniqueViolation(String),

    #[error("Route store database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Route store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Route store task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RouteStore: Send + Sync {
    /// All valid routes
    async fn list_routes(&self) -> StoreResult<Vec<RouteDefinition>>;

    async fn find_route(&self, id: &str) -> StoreResult<Option<RouteDefinition>>;

    /// Insert a new route. Fails with [`StoreError::UniqueViolation`] if the
    /// id is taken. Returns the row as stored (timestamps, version 0).
    async fn insert_route(&self, route: &RouteDefinition) -> StoreResult<RouteDefinition>;

    /// Update the row whose id and version both match `route`, bumping the
    /// version. `None` if no row matched.
    async fn update_route(&self, route: &RouteDefinition) -> StoreResult<Option<RouteDefinition>>;

    /// Whether a row was deleted
    async fn delete_route(&self, id: &str) -> StoreResult<bool>;
}

const SELECT_COLUMNS: &str =
    "id, uri, predicates, filters, create_time, update_time, version, order_no";

/// SQLite-backed route store
///
/// Queries run on the blocking pool so the async runtime never waits on disk.
#[derive(Clone)]
pub struct SqliteRouteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRouteStore {
    /// Open (or create) the route database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        Self::init(conn, &format!("{:?}", db_path.as_ref()))
    }

    /// Private in-memory database, mainly for tests and single-node trials
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> StoreResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS gateway_route (
                id VARCHAR(64) NOT NULL PRIMARY KEY,
                uri TEXT NOT NULL,
                predicates TEXT NOT NULL,
                filters TEXT NOT NULL,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                valid INTEGER NOT NULL DEFAULT 1,
                order_no INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        info!("Opened route store database: {}", label);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock_or_recover(&conn, "route store connection");
            op(&*guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn row_to_route(row: &Row<'_>) -> rusqlite::Result<(RouteDefinition, String, String)> {
    let created: i64 = row.get(4)?;
    let updated: i64 = row.get(5)?;
    let route = RouteDefinition {
        id: row.get(0)?,
        uri: row.get(1)?,
        predicates: Vec::new(),
        filters: Vec::new(),
        created_at: millis_to_datetime(created),
        updated_at: millis_to_datetime(updated),
        version: row.get(6)?,
        order: row.get(7)?,
    };
    Ok((route, row.get(2)?, row.get(3)?))
}

fn decode_route(
    (mut route, predicates, filters): (RouteDefinition, String, String),
) -> StoreResult<RouteDefinition> {
    route.predicates = serde_json::from_str(&predicates)?;
    route.filters = serde_json::from_str(&filters)?;
    Ok(route)
}

fn select_by_id(conn: &Connection, id: &str) -> StoreResult<Option<RouteDefinition>> {
    let sql = format!(
        "SELECT {} FROM gateway_route WHERE id = ?1 AND valid = 1",
        SELECT_COLUMNS
    );
    conn.query_row(&sql, params![id], row_to_route)
        .optional()?
        .map(decode_route)
        .transpose()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl RouteStore for SqliteRouteStore {
    async fn list_routes(&self) -> StoreResult<Vec<RouteDefinition>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM gateway_route WHERE valid = 1 ORDER BY order_no, id",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], row_to_route)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode_route).collect()
        })
        .await
    }

    async fn find_route(&self, id: &str) -> StoreResult<Option<RouteDefinition>> {
        let id = id.to_string();
        self.with_conn(move |conn| select_by_id(conn, &id)).await
    }

    async fn insert_route(&self, route: &RouteDefinition) -> StoreResult<RouteDefinition> {
        let route = route.clone();
        self.with_conn(move |conn| {
            let now = Utc::now().timestamp_millis();
            let predicates = serde_json::to_string(&route.predicates)?;
            let filters = serde_json::to_string(&route.filters)?;

            conn.execute(
                "INSERT INTO gateway_route
                    (id, uri, predicates, filters, create_time, update_time, version, valid, order_no)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, 1, ?6)",
                params![route.id, route.uri, predicates, filters, now, route.order],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::UniqueViolation(route.id.clone())
                } else {
                    StoreError::Database(e)
                }
            })?;

            debug!("Inserted route {} into store", route.id);
            select_by_id(conn, &route.id)?
                .ok_or_else(|| StoreError::Task(format!("route {} vanished after insert", route.id)))
        })
        .await
    }

    async fn update_route(&self, route: &RouteDefinition) -> StoreResult<Option<RouteDefinition>> {
        let route = route.clone();
        self.with_conn(move |conn| {
            let now = Utc::now().timestamp_millis();
            let predicates = serde_json::to_string(&route.predicates)?;
            let filters = serde_json::to_string(&route.filters)?;

            let rows = conn.execute(
                "UPDATE gateway_route
                 SET uri = ?1, predicates = ?2, filters = ?3, order_no = ?4,
                     update_time = ?5, version = version + 1
                 WHERE id = ?6 AND version = ?7 AND valid = 1",
                params![
                    route.uri,
                    predicates,
                    filters,
                    route.order,
                    now,
                    route.id,
                    route.version
                ],
            )?;

            if rows == 0 {
                return Ok(None);
            }
            debug!("Updated route {} (version {} -> {})", route.id, route.version, route.version + 1);
            select_by_id(conn, &route.id)
        })
        .await
    }

    async fn delete_route(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let rows = conn.execute("DELETE FROM gateway_route WHERE id = ?1", params![id])?;
            Ok(rows > 0)
        })
        .await
    }
}
