//! Supervised background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Pause before restarting a task that panicked.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Run the future produced by `make` until it returns or `cancel` fires.
///
/// A panic inside the task is logged and the task is started again from
/// `make`; a normal return ends supervision.
pub fn supervise<F, Fut>(name: &'static str, cancel: CancellationToken, make: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts = 0u32;
        loop {
            let mut task = tokio::spawn(make());
            tokio::select! {
                _ = cancel.cancelled() => {
                    task.abort();
                    debug!(task = name, "task cancelled");
                    break;
                }
                joined = &mut task => match joined {
                    Ok(()) => {
                        debug!(task = name, "task finished");
                        break;
                    }
                    Err(e) if e.is_panic() => {
                        restarts += 1;
                        error!(task = name, restarts, "task panicked, restarting");
                    }
                    Err(_) => break,
                },
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
    })
}
