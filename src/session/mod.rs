//! Session lifecycle: the in-memory registry, the manager that keeps it in
//! step with storage, and the two periodic jobs that reconcile and expire it.

mod manager;
mod poller;
mod reaper;
mod registry;

pub use manager::{generate_mac, OpenedSession, SessionManager, SessionSettings, DEFAULT_PROTOCOL};
pub use poller::{ExternalStatePoller, ReconcileReport};
pub use reaper::IdleReaper;
pub use registry::{Session, SessionRegistry};
