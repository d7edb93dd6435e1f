use crate::config::{DevboxConfig, OrchestratorConfig};
use crate::discovery::{
    find_candidates, CandidateOffer, CandidateQuery, HardwareConstraints, ProfileSelector, SortKey,
};
use crate::error::{OrchestrateError, ProviderResultExt, Result};
use crate::logger;
use crate::resize::{ResizeReport, Resizer};
use devbox_common::{InstanceState, ResourceKind};
use devbox_providers::CloudProvider;

/// Candidates presented to the operator.
pub const RECOVERY_CANDIDATE_LIMIT: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    pub min_vcpus: Option<u32>,
    pub min_memory_gib: Option<f64>,
    pub max_price: Option<f64>,
    /// Resize to the cheapest candidate without asking.
    pub auto_confirm: bool,
}

#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub instance_id: String,
    pub current_profile: String,
    pub zone: String,
    pub constraints: HardwareConstraints,
    pub max_price: Option<f64>,
    /// Cheapest first, never including the current profile, all in `zone`.
    pub candidates: Vec<CandidateOffer>,
}

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub plan: RecoveryPlan,
    /// Present when auto-confirmation resized the instance.
    pub resize: Option<ResizeReport>,
}

/// Finds alternative profiles for an instance that cannot get capacity, in its own zone.
pub struct RecoveryPlanner<'a> {
    provider: &'a dyn CloudProvider,
    settings: &'a DevboxConfig,
    cfg: &'a OrchestratorConfig,
}

impl<'a> RecoveryPlanner<'a> {
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

    pub async fn plan(&self, instance_id: &str, opts: &RecoveryOptions) -> Result<RecoveryPlan> {
        let inst = self
            .provider
            .describe_instance(instance_id)
            .await
            .during("describe instance")?;
        if inst.state == InstanceState::Terminated {
            return Err(OrchestrateError::invalid_state(
                ResourceKind::Instance,
                &inst.id,
                inst.state,
                "recover",
            ));
        }

        let current = self
            .provider
            .describe_hardware_profiles(&[inst.profile.clone()])
            .await
            .during("describe hardware profile")?
            .into_iter()
            .find(|p| p.name == inst.profile)
            .ok_or_else(|| OrchestrateError::NotFound {
                kind: ResourceKind::Profile,
                id: inst.profile.clone(),
            })?;
        tracing::info!(
            "🩺 [recover] {} is {} ({} vCPU, {:.0} GiB, {}) in {}",
            inst.id,
            current.name,
            current.vcpus,
            current.memory_gib(),
            current.architecture,
            inst.zone
        );

        let constraints = HardwareConstraints {
            min_vcpus: opts.min_vcpus.unwrap_or(current.vcpus / 2),
            min_memory_gib: opts.min_memory_gib.unwrap_or(current.memory_gib() / 2.0),
            architecture: current.architecture.clone(),
            require_gpu: current.has_gpu,
        };
        let max_price = match opts.max_price {
            Some(p) => Some(p),
            None => self.default_max_price()?,
        };

        let query = CandidateQuery {
            profiles: ProfileSelector::Constraints(constraints.clone()),
            zone: Some(inst.zone.clone()),
            max_price,
            sort: SortKey::Price,
            limit: None,
        };
        let mut candidates: Vec<CandidateOffer> = find_candidates(self.provider, &query, self.cfg)
            .await?
            .into_iter()
            .filter(|c| c.profile.name != inst.profile && c.zone == inst.zone)
            .collect();
        candidates.truncate(RECOVERY_CANDIDATE_LIMIT);
        let summary = format!("{} alternative(s) in {}", candidates.len(), inst.zone);
        logger::log_quick("RECOVERY_PLAN", &inst.id, Some(&summary));

        Ok(RecoveryPlan {
            instance_id: inst.id,
            current_profile: inst.profile,
            zone: inst.zone,
            constraints,
            max_price,
            candidates,
        })
    }

    /// Plan, then resize to the cheapest candidate if `auto_confirm` is set.
    pub async fn recover(&self, instance_id: &str, opts: &RecoveryOptions) -> Result<RecoveryReport> {
        let plan = self.plan(instance_id, opts).await?;
        let cheapest = match (opts.auto_confirm, plan.candidates.first()) {
            (true, Some(c)) => c.profile.name.clone(),
            (true, None) => {
                tracing::warn!("🩺 [recover] no candidates, nothing to resize to");
                return Ok(RecoveryReport { plan, resize: None });
            }
            (false, _) => return Ok(RecoveryReport { plan, resize: None }),
        };

        tracing::info!("🩺 [recover] resizing {} to {}", instance_id, cheapest);
        let report = Resizer::new(self.provider, self.settings, self.cfg)
            .resize(instance_id, &cheapest)
            .await?;
        Ok(RecoveryReport {
            plan,
            resize: Some(report),
        })
    }

    fn default_max_price(&self) -> Result<Option<f64>> {
        let raw = self.settings.default_max_price.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<f64>().map(Some).map_err(|_| {
            OrchestrateError::Config(format!("default_max_price {:?} is not a number", raw))
        })
    }
}
