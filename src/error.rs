//! Gateway error taxonomy
//!
//! Domain errors are returned synchronously from manager operations and are
//! never swallowed. Infrastructure failures (KV transport, publish, cache
//! loaders) are absorbed at the component boundary and do not show up here,
//! except for route store failures which a caller must see.

use thiserror::Error;

use crate::route_store::StoreError;

/// Result alias used across the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Route id already exists: {0}")]
    DuplicateRouteId(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("No routes defined in the route store")]
    NoRoutesDefined,

    #[error("Invalid route definition: {0}")]
    InvalidRoute(String),

    #[error("Invalid lock argument: {0}")]
    InvalidLockArgument(String),

    /// The generator refuses to produce ids once time goes backwards
    #[error("Clock moved backwards: last id at {last_millis}ms, clock now reads {now_millis}ms")]
    ClockMovedBackwards { last_millis: u64, now_millis: u64 },

    #[error("Invalid {field}: {value} (must be within 0..=31)")]
    InvalidGeneratorId { field: &'static str, value: u64 },

    #[error("Route broadcast failed: {0}")]
    Broadcast(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Whether this error is a caller mistake rather than a server fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::DuplicateRouteId(_)
                | GatewayError::RouteNotFound(_)
                | GatewayError::NoRoutesDefined
                | GatewayError::InvalidRoute(_)
                | GatewayError::InvalidLockArgument(_)
        )
    }
}
