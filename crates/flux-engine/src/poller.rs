use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use flux_contracts::events::task_payload;
use flux_contracts::logging::Logger;
use flux_contracts::tasks::{TaskSnapshot, TaskState};
use serde_json::{json, Value};

use crate::error::{ApiError, PollError};
use crate::transport::TransportErrorKind;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    /// Direct status URL for the task; preferred over `get_result?id=`.
    pub status_endpoint: Option<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub backoff_cap: Option<Duration>,
    pub show_progress: bool,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            status_endpoint: None,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_cap: None,
            show_progress: false,
        }
    }
}

impl PollOptions {
    pub fn with_status_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.status_endpoint = endpoint.filter(|url| !url.trim().is_empty());
        self
    }

    /// `2^failures` seconds, clamped to `backoff_cap` when one is set.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let secs = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
        let delay = Duration::from_secs(secs);
        match self.backoff_cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Cancellation flag shared between a caller and any number of poll
/// sessions. Sleeping sessions wake as soon as it is cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks for up to `duration`. Returns `true` when woken by
    /// cancellation.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = signal
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Blocks until `receiver` yields a value, its sender goes away, or the
    /// token is cancelled. Senders must call [`CancellationToken::wake`]
    /// after sending or dropping so the wait re-checks the channel.
    fn recv_unless_cancelled<T>(&self, receiver: &Receiver<T>) -> Result<T, Interrupted> {
        let (flag, signal) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return Err(Interrupted::Cancelled);
            }
            match receiver.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Disconnected) => return Err(Interrupted::Disconnected),
                Err(TryRecvError::Empty) => {}
            }
            cancelled = signal.wait(cancelled).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wake(&self) {
        let (flag, signal) = &*self.inner;
        let _held = flag.lock().unwrap_or_else(PoisonError::into_inner);
        signal.notify_all();
    }
}

enum Interrupted {
    Cancelled,
    Disconnected,
}

/// Wakes waiters on drop, after the worker's sender is gone.
struct WakeOnDrop(CancellationToken);

impl Drop for WakeOnDrop {
    fn drop(&mut self) {
        self.0.wake();
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    /// Sleeps for `duration` or until `cancel` fires.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancellationToken) {
        cancel.wait_timeout(duration);
    }
}

static SYSTEM_CLOCK: SystemClock = SystemClock;

/// Anything that can fetch one status snapshot for a task.
pub trait TaskSource: Send + Sync {
    fn fetch_task(
        &self,
        task_id: &str,
        status_endpoint: Option<&str>,
    ) -> Result<TaskSnapshot, ApiError>;
}

/// Turns a submitted task id into its finished snapshot.
///
/// Each `wait_for_result` call is an isolated session: its failure counter
/// and start time live on the stack, so one poller can serve many tasks from
/// different threads.
///
/// Status fetches run on a short-lived worker thread so a cancelled session
/// returns at once instead of waiting out the request timeout. The abandoned
/// fetch finishes in the background and its result is dropped.
pub struct TaskPoller<'a> {
    source: Arc<dyn TaskSource>,
    clock: &'a dyn Clock,
    logger: Logger,
    cancel: CancellationToken,
}

impl<'a> TaskPoller<'a> {
    pub fn new(source: Arc<dyn TaskSource>, logger: Logger) -> Self {
        Self {
            source,
            clock: &SYSTEM_CLOCK,
            logger,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn wait_for_result(
        &self,
        task_id: &str,
        options: &PollOptions,
    ) -> Result<TaskSnapshot, PollError> {
        let started = self.clock.now();
        let mut failures: u32 = 0;
        let mut fetches: u32 = 0;

        self.logger.event(
            "poll_started",
            task_payload(
                task_id,
                json!({
                    "status_endpoint": options.status_endpoint,
                    "timeout_s": options.timeout.as_secs_f64(),
                    "poll_interval_s": options.poll_interval.as_secs_f64(),
                    "max_retries": options.max_retries,
                }),
            ),
        );

        loop {
            if self.cancel.is_cancelled() {
                return self.fail(
                    PollError::Cancelled {
                        task_id: task_id.to_string(),
                    },
                    fetches,
                );
            }
            let elapsed = self.clock.now().saturating_duration_since(started);
            if elapsed > options.timeout {
                return self.fail(
                    PollError::Timeout {
                        task_id: task_id.to_string(),
                        elapsed,
                        timeout: options.timeout,
                    },
                    fetches,
                );
            }

            fetches += 1;
            let fetched = match self.fetch(task_id, options.status_endpoint.as_deref()) {
                Some(fetched) => fetched,
                None => {
                    self.logger
                        .info(format!("task {task_id}: cancelled during status request"));
                    return self.fail(
                        PollError::Cancelled {
                            task_id: task_id.to_string(),
                        },
                        fetches,
                    );
                }
            };
            match fetched {
                Ok(snapshot) => {
                    self.report_status(task_id, &snapshot, elapsed, options.show_progress);
                    match snapshot.state {
                        TaskState::Ready => {
                            if snapshot.artifact.is_none() {
                                return self.fail(
                                    PollError::GenerationFailed {
                                        task_id: task_id.to_string(),
                                        reason: "task is Ready but carries no result sample"
                                            .to_string(),
                                    },
                                    fetches,
                                );
                            }
                            self.logger.info(format!(
                                "task {task_id} ready after {fetches} polls ({:.1}s)",
                                elapsed.as_secs_f64()
                            ));
                            self.logger.event(
                                "poll_finished",
                                task_payload(
                                    task_id,
                                    json!({
                                        "fetches": fetches,
                                        "elapsed_s": elapsed.as_secs_f64(),
                                        "artifact": snapshot.artifact,
                                    }),
                                ),
                            );
                            return Ok(snapshot);
                        }
                        TaskState::Error | TaskState::NotFound => {
                            let reason = snapshot
                                .failure_reason
                                .unwrap_or_else(|| snapshot.state.as_str().to_string());
                            return self.fail(
                                PollError::GenerationFailed {
                                    task_id: task_id.to_string(),
                                    reason,
                                },
                                fetches,
                            );
                        }
                        TaskState::ContentModerated => {
                            return self.fail(
                                PollError::ContentModerated {
                                    task_id: task_id.to_string(),
                                    detail: moderation_detail(&snapshot),
                                },
                                fetches,
                            );
                        }
                        TaskState::Pending | TaskState::RequestModerated => {
                            failures = 0;
                        }
                    }
                }
                Err(err) if err.is_moderation() => {
                    return self.fail(
                        PollError::ContentModerated {
                            task_id: task_id.to_string(),
                            detail: err.to_string(),
                        },
                        fetches,
                    );
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    if failures > options.max_retries {
                        return self.fail(
                            PollError::ExhaustedRetries {
                                task_id: task_id.to_string(),
                                retries: options.max_retries,
                                source: err,
                            },
                            fetches,
                        );
                    }
                    let delay = options.backoff_delay(failures);
                    self.logger.warn(format!(
                        "transient error polling {task_id} (attempt {failures}/{}): {err}; retrying in {}s",
                        options.max_retries,
                        delay.as_secs()
                    ));
                    self.logger.event(
                        "poll_retry",
                        task_payload(
                            task_id,
                            json!({
                                "attempt": failures,
                                "max_retries": options.max_retries,
                                "delay_s": delay.as_secs_f64(),
                                "status": err.status(),
                                "error": err.to_string(),
                            }),
                        ),
                    );
                    self.clock.sleep(delay, &self.cancel);
                    continue;
                }
                Err(err) => {
                    return self.fail(
                        PollError::Request {
                            task_id: task_id.to_string(),
                            source: err,
                        },
                        fetches,
                    );
                }
            }

            self.clock.sleep(options.poll_interval, &self.cancel);
        }
    }

    /// One status fetch on a worker thread. `None` when the session was
    /// cancelled before the reply arrived.
    fn fetch(
        &self,
        task_id: &str,
        status_endpoint: Option<&str>,
    ) -> Option<Result<TaskSnapshot, ApiError>> {
        let (sender, receiver) = mpsc::channel();
        let source = Arc::clone(&self.source);
        let wake = WakeOnDrop(self.cancel.clone());
        let owned_id = task_id.to_string();
        let owned_endpoint = status_endpoint.map(str::to_string);
        let spawned = thread::Builder::new()
            .name("flux-fetch".to_string())
            .spawn(move || {
                let _wake = wake;
                let sender = sender;
                let _ = sender.send(source.fetch_task(&owned_id, owned_endpoint.as_deref()));
            });
        if let Err(err) = spawned {
            self.logger
                .warn(format!("could not spawn fetch worker ({err}); fetching inline"));
            return Some(self.source.fetch_task(task_id, status_endpoint));
        }
        match self.cancel.recv_unless_cancelled(&receiver) {
            Ok(fetched) => Some(fetched),
            Err(Interrupted::Cancelled) => None,
            Err(Interrupted::Disconnected) => Some(Err(ApiError::Transport {
                kind: TransportErrorKind::Other,
                message: "status request aborted without a reply".to_string(),
            })),
        }
    }

    fn report_status(
        &self,
        task_id: &str,
        snapshot: &TaskSnapshot,
        elapsed: Duration,
        show_progress: bool,
    ) {
        if !snapshot.is_recognized_status() {
            self.logger.warn(format!(
                "task {task_id} returned unknown status {:?}; still waiting",
                snapshot.raw_status
            ));
        }
        let line = match snapshot.progress {
            Some(progress) => format!(
                "task {task_id}: {} ({:.0}%) after {:.1}s",
                snapshot.state.as_str(),
                progress * 100.0,
                elapsed.as_secs_f64()
            ),
            None => format!(
                "task {task_id}: {} after {:.1}s",
                snapshot.state.as_str(),
                elapsed.as_secs_f64()
            ),
        };
        if show_progress {
            self.logger.info(line);
        } else {
            self.logger.debug(line);
        }
        self.logger.event(
            "poll_status",
            task_payload(
                task_id,
                json!({
                    "status": snapshot.raw_status,
                    "state": snapshot.state.as_str(),
                    "progress": snapshot.progress,
                    "elapsed_s": elapsed.as_secs_f64(),
                }),
            ),
        );
    }

    fn fail(&self, err: PollError, fetches: u32) -> Result<TaskSnapshot, PollError> {
        self.logger.error(err.to_string());
        self.logger.event(
            "poll_failed",
            task_payload(
                err.task_id(),
                json!({
                    "kind": err.kind().as_str(),
                    "fetches": fetches,
                    "error": err.to_string(),
                }),
            ),
        );
        Err(err)
    }
}

fn moderation_detail(snapshot: &TaskSnapshot) -> String {
    snapshot
        .payload
        .get("details")
        .filter(|details| !details.is_null())
        .map(|details| match details {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| snapshot.state.as_str().to_string())
}
