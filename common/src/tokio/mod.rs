//! Thin facade over tokio so every crate in the workspace reaches the
//! runtime through one path. Long-running tasks go through [`spawn_task`]
//! so they show up in the logs with a name.

pub use tokio::{select, task, time};

pub mod sync {
    pub use tokio::sync::*;
}

use std::future::Future;

use log::trace;
use tokio::task::JoinHandle;

// Spawn a named background task
pub fn spawn_task<F>(name: &str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if log::log_enabled!(log::Level::Trace) {
        trace!("Spawning task {}", name);
    }
    task::spawn(future)
}
