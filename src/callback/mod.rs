//! Callbacks from the VPN daemon: authentication, per-session setup,
//! disconnect and traffic reports, plus a status view for operators.

mod handler;
mod routes;

pub use handler::{AuthCallbackHandler, AuthReply, ConnectReply, StatusReport, DEFAULT_AUTH_TTL};
pub use routes::{router, ActivityRequest, ApiError, AuthRequest, REMOTE_IP_HEADER, USERNAME_HEADER};
