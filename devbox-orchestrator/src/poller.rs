use crate::config::OrchestratorConfig;
use crate::error::{OrchestrateError, ProviderResultExt, Result};
use devbox_common::{
    ComputeResource, InstanceState, ResourceKind, SnapshotState, StorageSnapshot, StorageVolume,
    VolumeState,
};
use devbox_providers::CloudProvider;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// One read of a polled resource.
#[derive(Debug)]
pub enum Observation<T> {
    /// Target reached; carries the final read.
    Reached(T),
    /// Not there yet; carries a description of the current state.
    Pending(String),
    /// The provider reports an explicit failure state.
    Failed(String),
}

/// What is being waited on, for error reporting.
#[derive(Debug, Clone, Copy)]
pub struct PollTarget<'a> {
    pub kind: ResourceKind,
    pub id: &'a str,
    pub target: &'a str,
}

/// Re-read until the target is observed, the provider reports failure, or `timeout` elapses.
///
/// Read errors are returned immediately. The first read happens without delay.
pub async fn poll_until<T, F, Fut>(
    what: PollTarget<'_>,
    interval: Duration,
    timeout: Duration,
    mut read: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Observation<T>>>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        let last_observed = match read().await? {
            Observation::Reached(value) => return Ok(value),
            Observation::Failed(message) => {
                return Err(OrchestrateError::TerminalProviderError {
                    kind: what.kind,
                    id: what.id.to_string(),
                    message,
                })
            }
            Observation::Pending(state) => state,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(OrchestrateError::Timeout {
                kind: what.kind,
                id: what.id.to_string(),
                target: what.target.to_string(),
                last_observed,
                waited: now - started,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

pub async fn wait_for_instance_state(
    provider: &dyn CloudProvider,
    instance_id: &str,
    target: InstanceState,
    cfg: &OrchestratorConfig,
) -> Result<ComputeResource> {
    tracing::info!("⏳ [poller] waiting for instance {} to be {}", instance_id, target);
    let what = PollTarget {
        kind: ResourceKind::Instance,
        id: instance_id,
        target: target.as_str(),
    };
    poll_until(what, cfg.instance_poll, cfg.instance_timeout, move || async move {
        let inst = provider
            .describe_instance(instance_id)
            .await
            .during("describe instance")?;
        Ok(classify_instance(inst, target))
    })
    .await
}

fn classify_instance(inst: ComputeResource, target: InstanceState) -> Observation<ComputeResource> {
    if inst.state == target {
        Observation::Reached(inst)
    } else if inst.state == InstanceState::Terminated {
        Observation::Failed(format!("terminated while waiting for {}", target))
    } else {
        Observation::Pending(inst.state.to_string())
    }
}

pub async fn wait_for_volume_state(
    provider: &dyn CloudProvider,
    volume_id: &str,
    target: VolumeState,
    cfg: &OrchestratorConfig,
) -> Result<StorageVolume> {
    let what = PollTarget {
        kind: ResourceKind::Volume,
        id: volume_id,
        target: target.as_str(),
    };
    poll_until(what, cfg.volume_poll, cfg.volume_timeout, move || async move {
        let vol = provider
            .describe_volume(volume_id)
            .await
            .during("describe volume")?;
        Ok(if vol.state == target {
            Observation::Reached(vol)
        } else if vol.state == VolumeState::Error {
            Observation::Failed("volume entered error state".to_string())
        } else {
            Observation::Pending(vol.state.to_string())
        })
    })
    .await
}

/// Wait for a snapshot to complete, logging progress along the way.
pub async fn wait_for_snapshot_completed(
    provider: &dyn CloudProvider,
    snapshot_id: &str,
    cfg: &OrchestratorConfig,
) -> Result<StorageSnapshot> {
    let what = PollTarget {
        kind: ResourceKind::Snapshot,
        id: snapshot_id,
        target: "completed",
    };
    poll_until(what, cfg.snapshot_poll, cfg.snapshot_timeout, move || async move {
        let snap = provider
            .describe_snapshot(snapshot_id)
            .await
            .during("describe snapshot")?;
        Ok(match snap.state {
            SnapshotState::Completed => Observation::Reached(snap),
            SnapshotState::Error => Observation::Failed(
                snap.state_message
                    .unwrap_or_else(|| "snapshot entered error state".to_string()),
            ),
            SnapshotState::Pending => {
                let progress = snap.progress.unwrap_or(0);
                tracing::info!("📸 [poller] snapshot {}: {}%", snapshot_id, progress);
                Observation::Pending(format!("pending ({}%)", progress))
            }
        })
    })
    .await
}
