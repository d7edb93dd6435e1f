use crate::config::OrchestratorConfig;
use crate::error::{Degraded, OrchestrateError, ProviderResultExt, Result};
use crate::logger::tracked;
use crate::poller::{wait_for_snapshot_completed, wait_for_volume_state};
use devbox_common::{user_tags, CreateVolumeSpec, ResourceKind, StorageVolume, VolumeState};
use devbox_providers::CloudProvider;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMoveRequest {
    /// A `vol-` id or a `Name` tag.
    pub volume: String,
    pub target_region: String,
    /// Defaults to zone "a" of the target region.
    pub target_zone: Option<String>,
    /// Delete both intermediate snapshots once the new volume is available.
    pub cleanup: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeMoveReport {
    pub source_volume_id: String,
    pub source_region: String,
    pub target_region: String,
    pub target_zone: String,
    pub new_volume_id: String,
    pub source_snapshot_id: String,
    pub target_snapshot_id: String,
    pub deleted_snapshots: Vec<String>,
    pub degraded: Vec<Degraded>,
}

/// Resolve a volume reference: ids pass through, anything else is matched against `Name` tags.
pub async fn resolve_volume(provider: &dyn CloudProvider, reference: &str) -> Result<String> {
    if reference.starts_with("vol-") {
        return Ok(reference.to_string());
    }
    let matches = provider
        .find_volumes_by_name(reference)
        .await
        .during("look up volume by name")?;
    match matches.as_slice() {
        [] => Err(OrchestrateError::NotFound {
            kind: ResourceKind::Volume,
            id: reference.to_string(),
        }),
        [only] => Ok(only.id.clone()),
        many => {
            let ids: Vec<&str> = many.iter().map(|v| v.id.as_str()).collect();
            Err(OrchestrateError::invalid_state(
                ResourceKind::Volume,
                reference,
                format!("ambiguous (matches {}), use the volume id", ids.join(", ")),
                "resolve volume name",
            ))
        }
    }
}

/// Moves a volume to another region through snapshot, cross-region copy and re-create.
///
/// No cleanup happens on failure; the error names the stage and what was created so far.
pub struct VolumeRelocationOrchestrator<'a> {
    source: &'a dyn CloudProvider,
    cfg: &'a OrchestratorConfig,
}

impl<'a> VolumeRelocationOrchestrator<'a> {
    pub fn new(source: &'a dyn CloudProvider, cfg: &'a OrchestratorConfig) -> Self {
        Self { source, cfg }
    }

    pub async fn relocate(&self, req: &VolumeMoveRequest) -> Result<VolumeMoveReport> {
        let volume_id = resolve_volume(self.source, &req.volume).await?;
        let source_region = self.source.region().to_string();
        let target_zone = req
            .target_zone
            .clone()
            .unwrap_or_else(|| format!("{}a", req.target_region));

        let src = self
            .source
            .describe_volume(&volume_id)
            .await
            .during("describe source volume")?;
        tracing::info!(
            "📦 [volume-move] {} ({} GiB {}) {} -> {} ({})",
            src.id,
            src.size_gib,
            src.performance.volume_type,
            source_region,
            req.target_region,
            target_zone
        );
        let target = self
            .source
            .for_region(&req.target_region)
            .during("open target region client")?;

        let mut created: Vec<String> = Vec::new();
        let fail = |stage: &str, created: &[String], source: OrchestrateError| {
            tracing::error!(
                "❌ [volume-move] failed at {} (created so far: {:?}): {}",
                stage,
                created,
                source
            );
            OrchestrateError::RelocationFailed {
                stage: stage.to_string(),
                created: created.to_vec(),
                source: Box::new(source),
            }
        };

        let src_snap = tracked(
            "CREATE_SNAPSHOT",
            &volume_id,
            Some(json!({ "region": source_region })),
            self.source.create_snapshot(
                &volume_id,
                &format!("devbox move: {} -> {}", volume_id, req.target_region),
            ),
        )
        .await
        .during("create source snapshot")
        .map_err(|e| fail("create source snapshot", &created, e))?;
        created.push(src_snap.clone());

        wait_for_snapshot_completed(self.source, &src_snap, self.cfg)
            .await
            .map_err(|e| fail("wait for source snapshot", &created, e))?;

        let dst_snap = tracked(
            "COPY_SNAPSHOT",
            &src_snap,
            Some(json!({ "from": source_region, "to": req.target_region })),
            target.copy_snapshot(
                &source_region,
                &src_snap,
                &format!("devbox move: {} from {}", volume_id, source_region),
            ),
        )
        .await
        .during("copy snapshot")
        .map_err(|e| fail("copy snapshot", &created, e))?;
        created.push(dst_snap.clone());

        wait_for_snapshot_completed(target.as_ref(), &dst_snap, self.cfg)
            .await
            .map_err(|e| fail("wait for target snapshot", &created, e))?;

        let spec = replica_spec(&src, &target_zone, &dst_snap);
        let new_volume_id = tracked(
            "CREATE_VOLUME",
            &dst_snap,
            Some(json!({ "zone": target_zone, "size_gib": spec.size_gib })),
            target.create_volume(&spec),
        )
        .await
        .during("create volume")
        .map_err(|e| fail("create volume", &created, e))?;
        created.push(new_volume_id.clone());

        wait_for_volume_state(target.as_ref(), &new_volume_id, VolumeState::Available, self.cfg)
            .await
            .map_err(|e| fail("wait for new volume", &created, e))?;
        tracing::info!(
            "✅ [volume-move] new volume {} available in {}",
            new_volume_id,
            target_zone
        );

        let mut deleted_snapshots = Vec::new();
        let mut degraded = Vec::new();
        if req.cleanup {
            let deletions = [
                (self.source, src_snap.as_str()),
                (target.as_ref(), dst_snap.as_str()),
            ];
            for (client, snapshot_id) in deletions {
                let res = tracked(
                    "DELETE_SNAPSHOT",
                    snapshot_id,
                    Some(json!({ "region": client.region() })),
                    client.delete_snapshot(snapshot_id),
                )
                .await;
                match res {
                    Ok(()) => deleted_snapshots.push(snapshot_id.to_string()),
                    Err(e) => {
                        tracing::warn!(
                            "⚠️ [volume-move] failed to delete snapshot {}: {}",
                            snapshot_id,
                            e
                        );
                        degraded.push(Degraded::SnapshotCleanup {
                            snapshot_id: snapshot_id.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(VolumeMoveReport {
            source_volume_id: volume_id,
            source_region,
            target_region: req.target_region.clone(),
            target_zone,
            new_volume_id,
            source_snapshot_id: src_snap,
            target_snapshot_id: dst_snap,
            deleted_snapshots,
            degraded,
        })
    }
}

/// Same size, performance class and tags as `src`, materialised from `snapshot_id`.
fn replica_spec(src: &StorageVolume, zone: &str, snapshot_id: &str) -> CreateVolumeSpec {
    CreateVolumeSpec {
        zone: zone.to_string(),
        size_gib: src.size_gib,
        performance: src.performance.clone(),
        snapshot_id: Some(snapshot_id.to_string()),
        tags: user_tags(&src.tags),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbox_common::{PerformanceClass, Tags};

    #[test]
    fn replica_keeps_size_performance_and_tags() {
        let mut tags = Tags::new();
        tags.insert("Name".to_string(), "home".to_string());
        tags.insert("aws:backup:source".to_string(), "x".to_string());
        let src = StorageVolume {
            id: "vol-1".to_string(),
            size_gib: 200,
            performance: PerformanceClass {
                volume_type: "gp3".to_string(),
                iops: Some(6000),
                throughput: Some(250),
            },
            zone: "us-east-2a".to_string(),
            state: VolumeState::Available,
            attachment: None,
            snapshot_id: None,
            tags,
        };
        let spec = replica_spec(&src, "eu-west-1b", "snap-9");
        assert_eq!(spec.size_gib, 200);
        assert_eq!(spec.performance, src.performance);
        assert_eq!(spec.snapshot_id.as_deref(), Some("snap-9"));
        assert_eq!(spec.tags.len(), 1);
        assert_eq!(spec.zone, "eu-west-1b");
    }
}
