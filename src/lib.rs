pub mod accessor;
/// Readiness-event listener that fills the pool from the project store.
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod store;

pub use accessor::{Accessor, Locator};
pub use error::{ConfigError, Diagnostic, StoreError};
pub use registry::{AccessorRegistry, BootstrapState};
pub use service::TdsService;
