//! Interest manager (§4.4).
//!
//! Tracks which remote jobs this node currently has live flows towards.
//! Registering interest is idempotent and (re)arms a quiescence timer; once
//! that timer fires without being reset, the interest is torn down and an
//! `interest/remove` notification goes out so the owning node can stop
//! pushing table updates we no longer need.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::control_channel::ControlChannel;
use crate::environment::Environment;
use crate::model::JobName;
use crate::resolver::Resolver;

/// Idle time after the last registration before an interest self-destructs.
pub const QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Topic a job's interest subscribes to so an external "a new table is
/// available" notification can reset the quiescence timer and trigger a
/// repull, without the node having to poll.
fn updates_topic(job_name: &str) -> String {
    format!("updates_available/{job_name}")
}

enum TimerMsg {
    Reset,
}

struct InterestHandle {
    reset_tx: mpsc::Sender<TimerMsg>,
    task: JoinHandle<()>,
}

/// Per-job quiescence timers backing the `interest/*` control-channel topic.
pub struct InterestManager {
    control: Arc<dyn ControlChannel>,
    resolver: Arc<Resolver>,
    environment: Arc<Environment>,
    active: Arc<Mutex<HashMap<JobName, InterestHandle>>>,
    timeout: Duration,
}

impl InterestManager {
    pub fn new(control: Arc<dyn ControlChannel>, resolver: Arc<Resolver>, environment: Arc<Environment>) -> Self {
        Self::with_timeout(control, resolver, environment, QUIESCENCE_TIMEOUT)
    }

    /// Test hook: a shorter timeout keeps quiescence tests fast.
    pub fn with_timeout(
        control: Arc<dyn ControlChannel>,
        resolver: Arc<Resolver>,
        environment: Arc<Environment>,
        timeout: Duration,
    ) -> Self {
        Self {
            control,
            resolver,
            environment,
            active: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Registers (or refreshes) interest in `job_name`. First call for a job
    /// publishes `interest/add`, subscribes to its `updates_available` topic
    /// and spawns its quiescence timer; later calls just reset the timer
    /// without touching the control channel again.
    pub async fn register_interest(&self, job_name: &str) {
        let already_running = {
            let guard = self.active.lock();
            guard.contains_key(job_name)
        };

        if already_running {
            let reset_tx = {
                let guard = self.active.lock();
                guard.get(job_name).map(|h| h.reset_tx.clone())
            };
            if let Some(tx) = reset_tx {
                let _ = tx.send(TimerMsg::Reset).await;
            }
            return;
        }

        if let Err(e) = self.control.publish("interest/add", job_name.as_bytes()).await {
            debug!(job_name, error = %e, "failed to publish interest/add");
        }

        let (reset_tx, mut reset_rx) = mpsc::channel(8);
        let topic = updates_topic(job_name);
        let reset_on_update = reset_tx.clone();
        let resolver_on_update = self.resolver.clone();
        let job_for_update = job_name.to_string();
        if let Err(e) = self
            .control
            .subscribe(
                &topic,
                Arc::new(move |_topic, _payload| {
                    let _ = reset_on_update.try_send(TimerMsg::Reset);
                    let resolver = resolver_on_update.clone();
                    let job = job_for_update.clone();
                    tokio::spawn(async move {
                        resolver.request_job_refresh(&job).await;
                    });
                }),
            )
            .await
        {
            debug!(job_name, error = %e, "failed to subscribe to updates_available");
        }

        let control = self.control.clone();
        let resolver = self.resolver.clone();
        let environment = self.environment.clone();
        let active = self.active.clone();
        let job_owned = job_name.to_string();
        let timeout = self.timeout;

        let task = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(timeout, reset_rx.recv()).await {
                    Ok(Some(TimerMsg::Reset)) => continue,
                    Ok(None) => break,
                    Err(_) => {
                        if environment.is_job_locally_deployed(&job_owned) {
                            debug!(job_name = %job_owned, "quiesced but still locally deployed, keeping interest");
                            continue;
                        }
                        debug!(job_name = %job_owned, "interest quiesced, tearing down");
                        active.lock().remove(&job_owned);
                        let _ = control.unsubscribe(&updates_topic(&job_owned)).await;
                        resolver.remove_service_entries(&job_owned);
                        let _ = control.publish("interest/remove", job_owned.as_bytes()).await;
                        break;
                    }
                }
            }
        });

        self.active.lock().insert(
            job_name.to_string(),
            InterestHandle { reset_tx, task },
        );
    }

    /// True while `job_name` has a live interest timer running.
    pub fn has_interest(&self, job_name: &str) -> bool {
        self.active.lock().contains_key(job_name)
    }

    /// Immediately tears down interest (used on shutdown), aborting the timer
    /// task rather than waiting out quiescence.
    pub async fn clear_interest(&self, job_name: &str) {
        let removed = self.active.lock().remove(job_name);
        if let Some(handle) = removed {
            handle.task.abort();
            let _ = self.control.publish("interest/remove", job_name.as_bytes()).await;
        }
    }
}
