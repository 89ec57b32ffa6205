pub mod config;
pub mod error;
pub mod keys;
pub mod ot;
pub mod pool;
pub mod server;
pub mod server_tracing;
pub mod session;
pub mod session_manager;
pub mod tag;
pub mod zkey;

pub use config::{CliFields, NotaryServerProperties};
pub use error::NotaryServerError;
pub use server::{build_router, run_server, NotaryGlobals};
pub use server_tracing::init_tracing;
