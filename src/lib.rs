pub mod cache;
pub mod config;
pub mod delay;
pub mod error;
pub mod handlers;
pub mod key_resolver;
pub mod memory_store;
pub mod middleware;
pub mod options;
pub mod redis;
pub mod response;
pub mod server;
pub mod slow_down;
pub mod store;

pub use config::Config;
pub use error::{SlowDownError, SlowDownResult};
pub use key_resolver::{ClientIpKeyGenerator, KeyGenerator, RequestInfo};
pub use memory_store::MemoryStore;
pub use options::{SlowDownConfig, SlowDownOptions};
pub use server::create_app;
pub use slow_down::SlowDown;
pub use store::CounterStore;
