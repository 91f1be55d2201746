//! The external VPN daemon: configuration, process supervision and the
//! control tool used to query and steer it.

mod control;
mod files;
mod supervisor;
pub mod template;

pub use control::{parse_active_users, parse_user_report, DaemonControl, DaemonStatus, Occtl, ReportedUser};
#[cfg(test)]
pub use control::MockDaemonControl;
pub use files::check_binary_available;
pub use supervisor::{DaemonState, Supervisor};
