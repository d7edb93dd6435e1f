use crate::boot_config::patch_boot_config;
use crate::config::{DevboxConfig, OrchestratorConfig};
use crate::dns::update_dns_best_effort;
use crate::error::{Degraded, OrchestrateError, ProviderResultExt, Result};
use crate::logger::{self, tracked};
use crate::poller::{wait_for_instance_state, wait_for_volume_state};
use crate::retry::with_consistency_retry;
use crate::state_machine::{MigrationProgress, ResizeStep, StateHistory, Transition};
use devbox_common::{
    user_tags, ComputeResource, InstanceState, InterruptionBehavior, LaunchSpec, MarketMode,
    MarketOptions, ResourceKind, VolumeAttachment, VolumeState,
};
use devbox_providers::CloudProvider;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizePath {
    NoOp,
    InPlace,
    ReplaceMigrate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResizeReport {
    pub original_id: String,
    /// The instance now running the target profile (differs from `original_id` after a migrate).
    pub instance_id: String,
    pub path: ResizePath,
    pub profile: String,
    pub public_ip: Option<String>,
    pub degraded: Vec<Degraded>,
    pub transitions: Vec<Transition>,
}

/// Launch parameters captured from the original before anything is changed.
struct Blueprint {
    spec: LaunchSpec,
    volumes: Vec<VolumeAttachment>,
}

/// Changes the profile of an instance, in place when the market allows it and by
/// replace-and-migrate otherwise.
pub struct Resizer<'a> {
    provider: &'a dyn CloudProvider,
    settings: &'a DevboxConfig,
    cfg: &'a OrchestratorConfig,
}

impl<'a> Resizer<'a> {
    pub fn new(
        provider: &'a dyn CloudProvider,
        settings: &'a DevboxConfig,
        cfg: &'a OrchestratorConfig,
    ) -> Self {
        Self {
            provider,
            settings,
            cfg,
        }
    }

    pub async fn resize(&self, instance_id: &str, target_profile: &str) -> Result<ResizeReport> {
        let mut history = StateHistory::new(instance_id);
        let inst = self
            .provider
            .describe_instance(instance_id)
            .await
            .during("describe instance")?;
        tracing::info!(
            "🔍 [resize] instance {}: profile={} state={} market={}",
            inst.id,
            inst.profile,
            inst.state,
            inst.market
        );

        if inst.profile == target_profile {
            history.transition(ResizeStep::NoOpSameProfile, "already the requested profile");
            logger::log_quick("RESIZE_NOOP", &inst.id, Some(target_profile));
            history.transition(ResizeStep::Done, "nothing to do");
            return Ok(ResizeReport {
                original_id: inst.id.clone(),
                instance_id: inst.id,
                path: ResizePath::NoOp,
                profile: inst.profile,
                public_ip: inst.public_ip,
                degraded: Vec::new(),
                transitions: history.into_transitions(),
            });
        }

        match inst.market {
            MarketMode::OnDemand => self.resize_in_place(inst, target_profile, history).await,
            MarketMode::SpotPersistent => {
                self.replace_migrate(inst, target_profile, history).await
            }
        }
    }

    async fn resize_in_place(
        &self,
        inst: ComputeResource,
        target_profile: &str,
        mut history: StateHistory,
    ) -> Result<ResizeReport> {
        history.transition(ResizeStep::InPlaceResize, "on-demand profile can be changed in place");
        self.stop_if_needed(&inst).await?;

        tracked(
            "MODIFY_INSTANCE_PROFILE",
            &inst.id,
            Some(json!({ "from": inst.profile, "to": target_profile })),
            self.provider.modify_instance_profile(&inst.id, target_profile),
        )
        .await
        .during("modify instance profile")?;

        self.start_and_wait(&inst.id).await?;
        let mut degraded = Vec::new();
        history.transition(ResizeStep::UpdateDns, "instance running");
        degraded.extend(update_dns_best_effort(self.provider, &inst.id, self.settings).await);
        history.transition(ResizeStep::Done, "resized in place");

        let running = self
            .provider
            .describe_instance(&inst.id)
            .await
            .during("describe instance")?;
        Ok(ResizeReport {
            original_id: inst.id.clone(),
            instance_id: inst.id,
            path: ResizePath::InPlace,
            profile: running.profile,
            public_ip: running.public_ip,
            degraded,
            transitions: history.into_transitions(),
        })
    }

    async fn replace_migrate(
        &self,
        inst: ComputeResource,
        target_profile: &str,
        mut history: StateHistory,
    ) -> Result<ResizeReport> {
        history.transition(
            ResizeStep::StopOriginal,
            "market-priced instances cannot change profile in place",
        );
        self.stop_if_needed(&inst).await?;

        let blueprint = self.capture_blueprint(&inst, target_profile).await?;
        tracing::info!(
            "📦 [resize] {} non-root volume(s) to migrate: {:?}",
            blueprint.volumes.len(),
            blueprint.volumes.iter().map(|v| &v.volume_id).collect::<Vec<_>>()
        );

        // Nothing below this launch touches the original until the replacement is running.
        history.transition(ResizeStep::LaunchReplacement, "launch parameters captured");
        let replacement_id = tracked(
            "LAUNCH_REPLACEMENT",
            &inst.id,
            Some(json!({ "profile": target_profile, "zone": inst.zone })),
            self.provider.launch_instance(&blueprint.spec),
        )
        .await
        .map_err(|e| {
            tracing::error!(
                "❌ [resize] launch failed, original {} is still intact: {}",
                inst.id,
                e
            );
            e
        })
        .during("launch replacement")?;
        tracing::info!("🚀 [resize] replacement {} launched", replacement_id);

        let mut progress = MigrationProgress::new(&inst.id);
        progress.replacement_id = Some(replacement_id.clone());
        let mut degraded = Vec::new();

        let outcome = self
            .migrate_to(
                &inst,
                &replacement_id,
                &blueprint,
                &mut progress,
                &mut history,
                &mut degraded,
            )
            .await;
        let running = match outcome {
            Ok(running) => running,
            Err(source) => {
                let step = history.current();
                tracing::error!(
                    "❌ [resize] migration aborted at {} ({}), no rollback attempted: {}",
                    step,
                    progress,
                    source
                );
                if step.touches_original() {
                    tracing::error!(
                        "❌ [resize] original {} was already being retired, inspect it by hand",
                        inst.id
                    );
                }
                return Err(OrchestrateError::MigrationAborted {
                    step: step.to_string(),
                    progress,
                    source: Box::new(source),
                });
            }
        };

        history.transition(ResizeStep::UpdateDns, "replacement running");
        degraded.extend(update_dns_best_effort(self.provider, &replacement_id, self.settings).await);
        history.transition(ResizeStep::Done, "migrated to replacement");

        for d in &degraded {
            tracing::warn!("⚠️ [resize] degraded: {}", d);
        }
        Ok(ResizeReport {
            original_id: inst.id,
            instance_id: replacement_id,
            path: ResizePath::ReplaceMigrate,
            profile: running.profile,
            public_ip: running.public_ip,
            degraded,
            transitions: history.into_transitions(),
        })
    }

    /// Everything after a successful launch. Errors are wrapped by the caller with the progress
    /// made so far.
    async fn migrate_to(
        &self,
        inst: &ComputeResource,
        replacement_id: &str,
        blueprint: &Blueprint,
        progress: &mut MigrationProgress,
        history: &mut StateHistory,
        degraded: &mut Vec<Degraded>,
    ) -> Result<ComputeResource> {
        history.transition(ResizeStep::ConfirmCapacity, "replacement launched");
        wait_for_instance_state(self.provider, replacement_id, InstanceState::Running, self.cfg)
            .await?;
        tracing::info!("✅ [resize] replacement {} running, capacity confirmed", replacement_id);

        history.transition(ResizeStep::QuiesceReplacement, "capacity confirmed");
        tracked(
            "STOP_REPLACEMENT",
            replacement_id,
            None,
            self.provider.stop_instance(replacement_id),
        )
        .await
        .during("stop replacement")?;
        wait_for_instance_state(self.provider, replacement_id, InstanceState::Stopped, self.cfg)
            .await?;
        if let Some(blob) = &blueprint.spec.boot_config {
            degraded.extend(self.push_boot_config(replacement_id, blob).await);
        }

        history.transition(ResizeStep::RetireOriginalMarketRequest, "replacement quiesced");
        if let Some(request_id) = &inst.market_request_id {
            tracked(
                "CANCEL_MARKET_REQUEST",
                request_id,
                Some(json!({ "instance_id": inst.id })),
                self.provider.cancel_market_request(request_id),
            )
            .await
            .during("cancel market request")?;
            progress.cancelled_market_request = Some(request_id.clone());
        }

        history.transition(ResizeStep::DetachFromOriginal, "market request retired");
        for vol in &blueprint.volumes {
            tracked(
                "DETACH_VOLUME",
                &vol.volume_id,
                Some(json!({ "instance_id": inst.id, "device": vol.device })),
                self.provider.detach_volume(&vol.volume_id, &inst.id),
            )
            .await
            .during("detach volume")?;
            progress.detached_volumes.push(vol.volume_id.clone());
        }
        for vol in &blueprint.volumes {
            wait_for_volume_state(self.provider, &vol.volume_id, VolumeState::Available, self.cfg)
                .await?;
        }

        history.transition(ResizeStep::TerminateOriginal, "volumes detached");
        tracked(
            "TERMINATE_ORIGINAL",
            &inst.id,
            None,
            self.provider.terminate_instance(&inst.id),
        )
        .await
        .during("terminate original")?;
        progress.original_terminated = true;
        wait_for_instance_state(self.provider, &inst.id, InstanceState::Terminated, self.cfg)
            .await?;

        history.transition(ResizeStep::AttachToReplacement, "original terminated");
        let mut requested = Vec::new();
        for vol in &blueprint.volumes {
            let res = tracked(
                "ATTACH_VOLUME",
                &vol.volume_id,
                Some(json!({ "instance_id": replacement_id, "device": vol.device })),
                self.provider
                    .attach_volume(&vol.volume_id, replacement_id, &vol.device),
            )
            .await;
            match res {
                Ok(()) => requested.push(vol),
                Err(e) => degraded.push(Degraded::VolumeAttach {
                    volume_id: vol.volume_id.clone(),
                    device: vol.device.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        for vol in requested {
            match wait_for_volume_state(self.provider, &vol.volume_id, VolumeState::InUse, self.cfg)
                .await
            {
                Ok(_) => progress.attached_volumes.push(vol.volume_id.clone()),
                Err(e) => degraded.push(Degraded::VolumeAttach {
                    volume_id: vol.volume_id.clone(),
                    device: vol.device.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        history.transition(ResizeStep::StartReplacement, "volumes attached");
        self.start_and_wait(replacement_id).await
    }

    async fn capture_blueprint(
        &self,
        inst: &ComputeResource,
        target_profile: &str,
    ) -> Result<Blueprint> {
        let image_id = inst.image_id.clone().ok_or_else(|| {
            OrchestrateError::invalid_state(
                ResourceKind::Instance,
                &inst.id,
                "missing its image id",
                "relaunch",
            )
        })?;

        let hostname = inst.name().unwrap_or(&self.settings.fallback_hostname);
        let boot_config = match self.provider.get_boot_config(&inst.id).await {
            Ok(blob) => blob.map(|b| patch_boot_config(&b, hostname)),
            Err(e) => {
                tracing::warn!("⚠️ [resize] could not read boot config of {}: {}", inst.id, e);
                None
            }
        };

        let mut max_price = self.settings.default_max_price.clone();
        if let Some(request_id) = &inst.market_request_id {
            match self.provider.describe_market_request(request_id).await {
                Ok(req) => {
                    if let Some(bid) = req.bid_price {
                        max_price = bid;
                    }
                }
                Err(e) => tracing::warn!(
                    "⚠️ [resize] could not read market request {}, bidding {}: {}",
                    request_id,
                    max_price,
                    e
                ),
            }
        }

        let spec = LaunchSpec {
            image_id,
            profile: target_profile.to_string(),
            zone: inst.zone.clone(),
            key_name: inst.key_name.clone(),
            subnet_id: inst.subnet_id.clone(),
            security_group_ids: inst.security_group_ids.clone(),
            iam_profile_arn: inst.iam_profile_arn.clone(),
            boot_config,
            market: MarketOptions::Spot {
                max_price,
                persistent: true,
                interruption: InterruptionBehavior::Stop,
            },
            root_volume: Some(self.settings.root_volume.clone()),
            tags: user_tags(&inst.tags),
        };
        Ok(Blueprint {
            spec,
            volumes: inst.non_root_attachments(),
        })
    }

    async fn stop_if_needed(&self, inst: &ComputeResource) -> Result<()> {
        match inst.state {
            InstanceState::Running | InstanceState::Pending => {
                tracked(
                    "STOP_INSTANCE",
                    &inst.id,
                    None,
                    self.provider.stop_instance(&inst.id),
                )
                .await
                .during("stop instance")?;
                wait_for_instance_state(self.provider, &inst.id, InstanceState::Stopped, self.cfg)
                    .await?;
                Ok(())
            }
            InstanceState::Stopped => Ok(()),
            other => Err(OrchestrateError::invalid_state(
                ResourceKind::Instance,
                &inst.id,
                other,
                "resize",
            )),
        }
    }

    async fn start_and_wait(&self, instance_id: &str) -> Result<ComputeResource> {
        let provider = self.provider;
        tracked(
            "START_INSTANCE",
            instance_id,
            None,
            with_consistency_retry(&self.cfg.start_retry, "start instance", || {
                provider.start_instance(instance_id)
            }),
        )
        .await?;
        wait_for_instance_state(self.provider, instance_id, InstanceState::Running, self.cfg).await
    }

    async fn push_boot_config(&self, instance_id: &str, blob: &str) -> Option<Degraded> {
        let res = tracked(
            "SET_BOOT_CONFIG",
            instance_id,
            None,
            self.provider.set_boot_config(instance_id, blob),
        )
        .await;
        let reason = match res {
            Ok(true) => return None,
            Ok(false) => "provider cannot replace boot config".to_string(),
            Err(e) => e.to_string(),
        };
        tracing::warn!("⚠️ [resize] could not update boot config on {}: {}", instance_id, reason);
        Some(Degraded::BootConfigPush {
            instance_id: instance_id.to_string(),
            reason,
        })
    }
}
