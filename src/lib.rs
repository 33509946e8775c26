pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod geo;
pub mod models;
pub mod observability;
pub mod state;
