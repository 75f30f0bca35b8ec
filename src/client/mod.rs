//! Backend access: endpoint pool, HTTP client, retries and usage accounting.

mod backend;
mod backend_pool;
mod llm_client;
mod retry;
mod usage;

pub use backend::*;
pub use backend_pool::*;
pub use llm_client::*;
pub use retry::*;
pub use usage::*;
