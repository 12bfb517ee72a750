//! Cluster-synchronized route table
//!
//! Writes go to the route store first, then a change event is broadcast to
//! every node, this one included. The local table changes only when an
//! event arrives (or on a full reload), so every node applies changes
//! through the same path.
//!
//! Delivery is best-effort. A node that misses an event stays stale until
//! its next reload, which the periodic reload task bounds. There are no
//! tombstones: an UPDATE for a route this node does not hold is dropped, but
//! an ADD that arrives after the DELETE of the same id still re-creates the
//! route until the next reload.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::distributed_lock::DistributedMutex;
use crate::error::{GatewayError, GatewayResult};
use crate::lock_utils::{read_lock_or_recover, write_lock_or_recover};
use crate::route::{RouteDefinition, RouteOp, RouteTable, RouteUpdateEvent};
use crate::route_bus::RouteEventBus;
use crate::route_store::{RouteStore, StoreError};

pub struct DynamicRouteManager {
    store: Arc<dyn RouteStore>,
    bus: Arc<dyn RouteEventBus>,
    table: RwLock<Arc<RouteTable>>,
    /// Serializes every table replacement
    apply_lock: Mutex<()>,
    table_tx: watch::Sender<Arc<RouteTable>>,
}

impl DynamicRouteManager {
    pub fn new(store: Arc<dyn RouteStore>, bus: Arc<dyn RouteEventBus>) -> Self {
        let empty = Arc::new(RouteTable::new());
        let (table_tx, _) = watch::channel(Arc::clone(&empty));
        Self {
            store,
            bus,
            table: RwLock::new(empty),
            apply_lock: Mutex::new(()),
            table_tx,
        }
    }

    /// Current active table
    pub fn table(&self) -> Arc<RouteTable> {
        Arc::clone(&read_lock_or_recover(&self.table, "route table"))
    }

    /// Receiver that sees every new active table
    pub fn subscribe_table(&self) -> watch::Receiver<Arc<RouteTable>> {
        self.table_tx.subscribe()
    }

    pub fn list_routes(&self) -> Vec<RouteDefinition> {
        self.table().sorted()
    }

    pub fn get_route(&self, id: &str) -> GatewayResult<RouteDefinition> {
        self.table()
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::RouteNotFound(id.to_string()))
    }

    pub async fn add_route(&self, definition: RouteDefinition) -> GatewayResult<RouteDefinition> {
        definition.validate()?;

        if self.table().contains(&definition.id) {
            return Err(GatewayError::DuplicateRouteId(definition.id));
        }

        let stored = self
            .store
            .insert_route(&definition)
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation(id) => GatewayError::DuplicateRouteId(id),
                other => GatewayError::Store(other),
            })?;

        info!("Route {} added to store, publishing ADD", stored.id);
        self.publish_after_write(RouteUpdateEvent::add(stored.clone())).await;
        Ok(stored)
    }

    pub async fn update_route(&self, definition: RouteDefinition) -> GatewayResult<RouteDefinition> {
        definition.validate()?;

        let updated = self
            .store
            .update_route(&definition)
            .await?
            .ok_or_else(|| GatewayError::RouteNotFound(definition.id.clone()))?;

        info!(
            "Route {} updated to version {}, publishing UPDATE",
            updated.id, updated.version
        );
        self.publish_after_write(RouteUpdateEvent::update(updated.clone())).await;
        Ok(updated)
    }

    pub async fn delete_route(&self, id: &str) -> GatewayResult<()> {
        if !self.store.delete_route(id).await? {
            return Err(GatewayError::RouteNotFound(id.to_string()));
        }

        info!("Route {} deleted from store, publishing DELETE", id);
        self.publish_after_write(RouteUpdateEvent::delete(id)).await;
        Ok(())
    }

    /// The store already holds the change; a lost broadcast is repaired by
    /// the next reload
    async fn publish_after_write(&self, event: RouteUpdateEvent) {
        if let Err(e) = self.bus.publish(&event).await {
            warn!(
                "Failed to publish {} event ({}); nodes converge at next reload",
                event.op_type, e
            );
        }
    }

    /// Replace the whole table with the store's contents. Returns the
    /// number of routes loaded.
    pub async fn reload(&self) -> GatewayResult<usize> {
        // Held across the read so an event applied meanwhile is not
        // overwritten by an older snapshot
        let _guard = self.apply_lock.lock().await;

        let routes = self.store.list_routes().await?;
        if routes.is_empty() {
            return Err(GatewayError::NoRoutesDefined);
        }

        let table = RouteTable::from_routes(routes);
        let count = table.len();
        self.install(table);
        info!("Route table reloaded from store: {} routes", count);
        Ok(count)
    }

    /// Apply one broadcast event to the local table
    pub async fn on_sync_message(&self, event: RouteUpdateEvent) -> GatewayResult<()> {
        event.validate().map_err(GatewayError::InvalidRoute)?;

        let (op, route_id, definition) = (event.op_type, event.route_id, event.route_definition);
        match (op, route_id, definition) {
            (RouteOp::Reload, _, _) => {
                self.reload().await?;
            }
            (RouteOp::Add | RouteOp::Update, _, Some(definition)) => {
                let _guard = self.apply_lock.lock().await;
                let current = self.table();
                // Unordered delivery: never let an older version overwrite a newer one
                match current.get(&definition.id) {
                    Some(existing) if existing.version > definition.version => {
                        debug!(
                            "Ignoring {} for {} at version {} (have {})",
                            op, definition.id, definition.version, existing.version
                        );
                        return Ok(());
                    }
                    None if op == RouteOp::Update => {
                        debug!("UPDATE for unknown route {} ignored", definition.id);
                        return Ok(());
                    }
                    _ => {}
                }
                info!("Applying {} for route {}", op, definition.id);
                self.install(current.with_upserted(definition));
            }
            (RouteOp::Delete, Some(id), _) => {
                let _guard = self.apply_lock.lock().await;
                let current = self.table();
                if current.contains(&id) {
                    info!("Applying DELETE for route {}", id);
                    self.install(current.without(&id));
                } else {
                    debug!("DELETE for unknown route {} ignored", id);
                }
            }
            (op, _, _) => {
                return Err(GatewayError::InvalidRoute(format!("malformed {} event", op)));
            }
        }
        Ok(())
    }

    /// Ask every node, this one included, to reload from the store
    pub async fn broadcast_reload(&self) -> GatewayResult<()> {
        self.bus
            .publish(&RouteUpdateEvent::reload())
            .await
            .map_err(|e| GatewayError::Broadcast(e.to_string()))?;
        info!("Broadcast RELOAD to the cluster");
        Ok(())
    }

    /// Caller must hold `apply_lock`
    fn install(&self, table: RouteTable) {
        let table = Arc::new(table);
        *write_lock_or_recover(&self.table, "route table") = Arc::clone(&table);
        self.table_tx.send_replace(table);
    }

    /// Apply every event from `rx` until the channel closes
    pub fn spawn_sync(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<RouteUpdateEvent>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let op = event.op_type;
                if let Err(e) = manager.on_sync_message(event).await {
                    match e {
                        GatewayError::NoRoutesDefined => warn!("{} ignored: {}", op, e),
                        other => error!("Failed to apply {} event: {}", op, other),
                    }
                }
            }
            info!("Route sync loop stopped: event channel closed");
        })
    }

    /// Reload on a fixed interval. With a lock, only the node that wins it
    /// for this interval broadcasts RELOAD for everyone; without one, each
    /// node reloads itself.
    pub fn spawn_periodic_reload(
        self: &Arc<Self>,
        interval: Duration,
        lock: Option<Arc<DistributedMutex>>,
        lock_key: String,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        // Expire before the next tick so the next round is open again
        let lock_ttl = interval.mul_f64(0.9).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; startup has just reloaded
            ticker.tick().await;

            loop {
                ticker.tick().await;

                match &lock {
                    Some(lock) => match lock.acquire(&lock_key, lock_ttl, 0, Duration::ZERO).await {
                        // The lease is left to expire so no other node wins this interval
                        Ok(Some(_lease)) => {
                            debug!("Won periodic reload lock '{}'", lock_key);
                            if let Err(e) = manager.broadcast_reload().await {
                                warn!("Periodic reload broadcast failed: {}", e);
                            }
                        }
                        Ok(None) => debug!("Another node holds '{}' this round", lock_key),
                        Err(e) => error!("Periodic reload lock misconfigured: {}", e),
                    },
                    None => match manager.reload().await {
                        Ok(count) => debug!("Periodic reload loaded {} routes", count),
                        Err(e) => warn!("Periodic reload failed: {}", e),
                    },
                }
            }
        })
    }
}
