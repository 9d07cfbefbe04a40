pub mod model;
pub mod pkce;
pub mod ratelimit;
pub mod scope;
pub mod server;
pub mod storage;

pub use server::{router, spawn_cleanup_sweep, validate_bearer_token, AuthConfig, AuthState};
