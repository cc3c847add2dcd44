//! Session restore and instance reconnection.
//!
//! A restored session reconnects to any live agent instances matching
//! the stored ids. Instances the broker no longer knows are treated as
//! failed attempts: their tasks leave the running mapping and re-enter
//! the scheduler as retry candidates when retries remain, or land in the
//! failed set otherwise.

use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use ensemble_state::session::{AttemptStatus, RetryState};
use ensemble_state::store::SessionStore;

use crate::broker::InstanceBroker;
use crate::dispatcher::SessionHandle;
use crate::observer::WorkflowObserver;

/// Load a session from the store and reconnect it to the broker.
pub async fn restore_session(
    store: Arc<dyn SessionStore>,
    id: Uuid,
    broker: &dyn InstanceBroker,
    observer: Arc<dyn WorkflowObserver>,
) -> Result<SessionHandle> {
    let session = store
        .load(id)
        .await
        .context("failed to load session document")?
        .with_context(|| format!("session {id} not found"))?;

    let handle = SessionHandle::new(session, store, observer);
    reconnect_instances(&handle, broker).await;
    handle.persist().await;
    Ok(handle)
}

/// Reconcile stored instance ids against the live broker.
pub async fn reconnect_instances(handle: &SessionHandle, broker: &dyn InstanceBroker) {
    // Collect the ids to probe without holding the lock across awaits.
    let ultra_running: Vec<(String, Uuid)> = handle.with_read(|s| {
        s.ultra()
            .map(|u| u.running.iter().map(|(t, i)| (t.clone(), *i)).collect())
            .unwrap_or_default()
    });

    let mut vanished: Vec<String> = Vec::new();
    for (task_id, instance) in &ultra_running {
        if broker.get(*instance).await.is_none() {
            vanished.push(task_id.clone());
        }
    }

    if !vanished.is_empty() {
        handle.mutate(|s| {
            let retry_cap = s.config.retry_cap;
            let Some(ultra) = s.ultra_mut() else {
                return;
            };
            for task_id in &vanished {
                ultra.running.remove(task_id);
                let retry = ultra
                    .retries
                    .entry(task_id.clone())
                    .or_insert_with(|| RetryState::new(retry_cap));
                retry.record_empty("instance not found");
                if !retry.retries_left() {
                    ultra.failed.insert(task_id.clone());
                }
            }
        });
        for task_id in &vanished {
            tracing::warn!(task = %task_id, "stored instance vanished, task requeued or failed");
        }
    }

    // The iterative loop's single instance.
    let loop_instance = handle.with_read(|s| s.iterative().and_then(|i| i.instance));
    if let Some(instance) = loop_instance {
        if broker.get(instance).await.is_none() {
            handle.mutate(|s| {
                if let Some(iter) = s.iterative_mut() {
                    iter.instance = None;
                }
            });
            tracing::warn!(%instance, "stored loop instance vanished");
        }
    }

    // Triple-shot attempts still marked running.
    let running_attempts: Vec<(usize, Uuid)> = handle.with_read(|s| {
        s.tripleshot()
            .map(|ts| {
                ts.attempts
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| a.status == AttemptStatus::Running)
                    .filter_map(|(i, a)| a.instance.map(|inst| (i, inst)))
                    .collect()
            })
            .unwrap_or_default()
    });
    for (index, instance) in running_attempts {
        if broker.get(instance).await.is_none() {
            handle.mutate(|s| {
                if let Some(ts) = s.tripleshot_mut() {
                    if let Some(attempt) = ts.attempts.get_mut(index) {
                        attempt.status = AttemptStatus::Failed;
                        attempt.summary = Some("instance not found after restore".to_string());
                    }
                }
            });
            tracing::warn!(attempt = index, "stored attempt instance vanished, marked failed");
        }
    }
}
