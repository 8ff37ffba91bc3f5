use futures_util::FutureExt;
use std::{
    borrow::Cow,
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

const RESTART_BACKOFF_START_MS: u64 = 200;
const RESTART_BACKOFF_MAX_MS: u64 = 10_000;

#[derive(Debug)]
pub(crate) struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// Background loops owned by the server, stopped together at shutdown.
#[derive(Default)]
pub(crate) struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        self.tasks.push(task);
    }

    /// Give each task `grace` to finish on its own, then abort it.
    pub(crate) async fn shutdown_with_grace(self, grace: Duration) {
        for task in self.tasks {
            let TaskHandle { name, mut handle } = task;
            if grace.is_zero() {
                handle.abort();
                if let Err(err) = handle.await {
                    debug!(task = %name, ?err, "task join after abort failed");
                }
                continue;
            }
            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    if let Err(err) = handle.await {
                        debug!(task = %name, ?err, "task join after abort failed");
                    }
                }
            }
        }
    }
}

/// Spawn a long-running loop that is restarted with exponential backoff if
/// it panics.
pub(crate) fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let name_for_task = name.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms = RESTART_BACKOFF_START_MS;
        let window = Duration::from_secs(30);
        let mut window_start = Instant::now();
        let mut restarts_in_window: u32 = 0;
        loop {
            match std::panic::AssertUnwindSafe(factory()).catch_unwind().await {
                Ok(()) => {
                    debug!(task = %name_for_task, "supervised task completed normally");
                    break;
                }
                Err(_) => {
                    let now = Instant::now();
                    if now.duration_since(window_start) > window {
                        window_start = now;
                        restarts_in_window = 0;
                        backoff_ms = RESTART_BACKOFF_START_MS;
                    }
                    restarts_in_window = restarts_in_window.saturating_add(1);
                    tracing::error!(task = %name_for_task, backoff_ms, restarts_in_window, "supervised task panicked; restarting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(RESTART_BACKOFF_MAX_MS);
                }
            }
        }
    });
    TaskHandle::new(name, handle)
}
