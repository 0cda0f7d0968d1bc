pub mod pool;
pub mod retry;

pub use pool::{Disposition, WorkerPool};
pub use retry::RetryPolicy;
