//! edgevpn - control plane for an ocserv VPN edge
//!
//! Keeps three views of "who is connected" consistent:
//! - the daemon's live user table, queried through its control tool
//! - persisted lease and online records (SQLite)
//! - an in-memory session registry used for activity and idle tracking
//!
//! Also supervises the daemon process, generates its configuration and
//! credential files, and answers its authentication callbacks.

pub mod callback;
pub mod config;
pub mod daemon;
pub mod error;
pub mod lease;
pub mod locks;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod validation;

// Re-export commonly used types
pub use callback::{router, AuthCallbackHandler, ConnectReply};
pub use config::ServerConfig;
pub use daemon::{DaemonControl, DaemonState, DaemonStatus, Occtl, ReportedUser, Supervisor};
pub use error::{EdgeError, EdgeResult};
pub use lease::{Allocator, Pool};
pub use scheduler::{PeriodicJob, Scheduler};
pub use session::{
    ExternalStatePoller, IdleReaper, Session, SessionManager, SessionRegistry, SessionSettings,
};
pub use store::Store;
