//! ingress-status: publishes the addresses of the running ingress controller
//! into the status of the Ingresses it serves

pub mod address;
pub mod cluster;
pub mod config;
pub mod election;
pub mod health;
pub mod ingress;
pub mod queue;
pub mod resolver;
pub mod sync;
pub mod updater;
pub mod watch;

pub use address::{AddressSet, StatusEntry};
pub use config::SyncConfig;
pub use sync::{ChangeSource, StatusSync, SyncState};
