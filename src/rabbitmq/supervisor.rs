//! Restart-on-failure boundary for background tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::errors::RabbitMQError;
use super::handler::panic_message;

/// Run `factory()` in its own task and restart it whenever it panics or
/// returns an error. A clean return or `shutdown` ends supervision.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    restart_delay: Duration,
    shutdown: CancellationToken,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), RabbitMQError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restarts: u64 = 0;

        loop {
            let mut task = tokio::spawn(factory());

            let outcome = tokio::select! {
                outcome = &mut task => outcome,
                _ = shutdown.cancelled() => {
                    // Give the task a chance to observe the same token and wind down.
                    match task.await {
                        Err(e) if e.is_panic() => {
                            error!(
                                task = name,
                                panic = %panic_message(e.into_panic().as_ref()),
                                "Task panicked during shutdown"
                            );
                        }
                        _ => {}
                    }
                    info!(task = name, "Supervised task stopped");
                    return;
                }
            };

            match outcome {
                Ok(Ok(())) => {
                    info!(task = name, "Supervised task finished");
                    return;
                }
                Ok(Err(e)) => error!(task = name, error = %e, "Supervised task failed"),
                Err(e) if e.is_panic() => error!(
                    task = name,
                    panic = %panic_message(e.into_panic().as_ref()),
                    "Supervised task panicked"
                ),
                Err(e) => {
                    warn!(task = name, error = %e, "Supervised task was cancelled");
                    return;
                }
            }

            restarts += 1;
            warn!(task = name, restarts, delay = ?restart_delay, "Restarting supervised task");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(restart_delay) => {}
            }
        }
    })
}
