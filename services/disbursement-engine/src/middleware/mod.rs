pub mod access_log;
pub mod auth;
pub mod origin;

pub use access_log::AccessLog;
pub use auth::BearerAuth;
pub use origin::ProxyTrust;
