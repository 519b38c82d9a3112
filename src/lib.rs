pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod router;
pub mod service;
pub mod types;

pub use error::ProvisionerError;
pub use service::reconciler::{Outcome, Reconciler};
