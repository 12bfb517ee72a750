// Library interface for the AEGIS gateway node
// Allows testing and reuse of the route sync and edge filter logic

pub mod admin_api;
pub mod auth_filter;
pub mod blacklist;
pub mod client_ip;
pub mod clock;
pub mod config;
pub mod distributed_lock;
pub mod error;
pub mod lazy_cache;
pub mod lock_utils;
pub mod proxy;
pub mod route;
pub mod route_bus;
pub mod route_manager;
pub mod route_store;
pub mod snowflake;
pub mod token;

pub use error::{GatewayError, GatewayResult};
