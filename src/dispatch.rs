use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::notification::{Device, Notification};
use crate::pushkin::Outcome;
use crate::registry::Registry;

/// Hard deadline for one inbound notification, across all its devices.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// What the HTTP layer needs to answer the homeserver.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchResult {
    /// Pushkeys the upstream clouds declared permanently dead.
    pub rejected: Vec<String>,

    /// True when the homeserver should resend the whole notification:
    /// something was retryable and nothing was delivered.
    pub retry: bool,
}

/// Fans one notification out to the pushkins its devices resolve to and
/// folds the per-device outcomes back into a single response.
pub struct Dispatcher {
    registry: Registry,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(registry: Registry, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    pub async fn dispatch(&self, notification: Notification) -> DispatchResult {
        self.metrics.notifications_received.inc();

        let notification = Arc::new(notification);
        let devices: Vec<Device> = notification.devices.clone();
        let mut outcomes: Vec<Option<Outcome>> = vec![None; devices.len()];

        // Group devices by the pushkin instance they resolve to, keeping
        // the original index so outcomes land back in request order.
        let mut groups: Vec<(Arc<crate::pushkin::PushkinInstance>, Vec<usize>)> = Vec::new();
        for (index, device) in devices.iter().enumerate() {
            match self.registry.lookup(&device.app_id) {
                None => {
                    warn!(app_id = %device.app_id, "no pushkin configured for app id");
                    outcomes[index] = Some(Outcome::rejected("no pushkin configured"));
                }
                Some(instance) => {
                    match groups
                        .iter_mut()
                        .find(|(existing, _)| Arc::ptr_eq(existing, instance))
                    {
                        Some((_, indices)) => indices.push(index),
                        None => groups.push((instance.clone(), vec![index])),
                    }
                }
            }
        }

        // Dispatch on detached tasks: if the homeserver goes away or the
        // deadline fires, in-flight upstream calls still run to completion;
        // only their outcomes are dropped.
        let (tx, mut rx) = mpsc::unbounded_channel::<(Vec<usize>, Vec<Outcome>)>();
        for (instance, indices) in groups {
            for chunk in indices.chunks(instance.max_batch_size()) {
                let chunk_indices = chunk.to_vec();
                let chunk_devices: Vec<Device> =
                    chunk_indices.iter().map(|&i| devices[i].clone()).collect();
                let tx = tx.clone();
                let instance = instance.clone();
                let notification = notification.clone();
                tokio::spawn(async move {
                    let chunk_outcomes = instance.dispatch(&notification, &chunk_devices).await;
                    let _ = tx.send((chunk_indices, chunk_outcomes));
                });
            }
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + REQUEST_DEADLINE;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((indices, chunk_outcomes))) => {
                    for (index, outcome) in indices.into_iter().zip(chunk_outcomes) {
                        outcomes[index] = Some(outcome);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("request deadline reached with dispatches still pending");
                    break;
                }
            }
        }

        let mut result = DispatchResult::default();
        let mut any_delivered = false;
        let mut any_retryable = false;
        let mut min_retry_after: Option<Duration> = None;

        for (device, outcome) in devices.into_iter().zip(outcomes) {
            let outcome =
                outcome.unwrap_or_else(|| Outcome::retryable("request deadline exceeded"));
            match outcome {
                Outcome::Delivered => any_delivered = true,
                Outcome::Rejected { reason } => {
                    debug!(
                        app_id = %device.app_id,
                        pushkey = %device.pushkey,
                        reason = %reason,
                        "pushkey rejected"
                    );
                    result.rejected.push(device.pushkey);
                }
                Outcome::Retryable {
                    reason,
                    retry_after,
                } => {
                    debug!(
                        app_id = %device.app_id,
                        pushkey = %device.pushkey,
                        reason = %reason,
                        "transient dispatch failure"
                    );
                    any_retryable = true;
                    if let Some(delay) = retry_after {
                        min_retry_after = Some(match min_retry_after {
                            Some(current) => current.min(delay),
                            None => delay,
                        });
                    }
                }
            }
        }

        result.retry = any_retryable && !any_delivered;

        // Honour upstream backpressure: hold the failure response for the
        // advertised retry-after, bounded by what is left of the deadline.
        if result.retry {
            if let Some(delay) = min_retry_after {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let delay = delay.min(remaining);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        result
    }

    pub async fn shutdown(&self) {
        for instance in self.registry.instances() {
            instance.shutdown().await;
        }
    }
}
