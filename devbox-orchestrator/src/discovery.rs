use crate::config::OrchestratorConfig;
use crate::error::{OrchestrateError, ProviderResultExt, Result};
use chrono::Utc;
use devbox_common::{HardwareProfile, PriceObservation, ProfileFilter};
use devbox_providers::CloudProvider;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Hardware lower bounds for a candidate profile.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareConstraints {
    pub min_vcpus: u32,
    pub min_memory_gib: f64,
    pub architecture: String,
    pub require_gpu: bool,
}

impl HardwareConstraints {
    fn admits(&self, profile: &HardwareProfile) -> bool {
        profile.vcpus >= self.min_vcpus
            && profile.memory_gib() >= self.min_memory_gib
            && (!self.require_gpu || profile.has_gpu)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProfileSelector {
    Constraints(HardwareConstraints),
    /// Explicit profile names, looked up directly. Unknown names are dropped.
    Names(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Price,
    Vcpu,
    Mem,
}

impl FromStr for SortKey {
    type Err = OrchestrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "price" => Ok(SortKey::Price),
            "vcpu" => Ok(SortKey::Vcpu),
            "mem" | "memory" => Ok(SortKey::Mem),
            other => Err(OrchestrateError::Config(format!(
                "unknown sort key {:?} (expected price, vcpu or mem)",
                other
            ))),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::Price => f.write_str("price"),
            SortKey::Vcpu => f.write_str("vcpu"),
            SortKey::Mem => f.write_str("mem"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub profiles: ProfileSelector,
    /// Restrict offers to one zone (attached storage cannot leave it).
    pub zone: Option<String>,
    pub max_price: Option<f64>,
    pub sort: SortKey,
    pub limit: Option<usize>,
}

/// A profile available in a zone at its latest observed spot price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateOffer {
    pub profile: HardwareProfile,
    pub zone: String,
    pub price: f64,
}

/// Enumerate matching profiles and join them with the latest spot price per (profile, zone).
///
/// An empty result is a valid "no match", never an error.
pub async fn find_candidates(
    provider: &dyn CloudProvider,
    query: &CandidateQuery,
    cfg: &OrchestratorConfig,
) -> Result<Vec<CandidateOffer>> {
    let profiles = match &query.profiles {
        ProfileSelector::Constraints(c) => {
            let filter = ProfileFilter {
                architecture: c.architecture.clone(),
                spot_supported: true,
                current_generation: true,
            };
            provider
                .list_hardware_profiles(&filter)
                .await
                .during("list hardware profiles")?
                .into_iter()
                .filter(|p| c.admits(p))
                .collect::<Vec<_>>()
        }
        ProfileSelector::Names(names) => provider
            .describe_hardware_profiles(names)
            .await
            .during("describe hardware profiles")?,
    };
    tracing::debug!("🔎 [discovery] {} profile(s) match", profiles.len());
    if profiles.is_empty() {
        return Ok(Vec::new());
    }

    let latest = latest_prices(provider, &profiles, cfg).await?;
    let by_name: HashMap<&str, &HardwareProfile> =
        profiles.iter().map(|p| (p.name.as_str(), p)).collect();

    let mut offers: Vec<CandidateOffer> = latest
        .into_values()
        .filter(|obs| query.zone.as_deref().map_or(true, |z| obs.zone == z))
        .filter(|obs| query.max_price.map_or(true, |max| obs.price <= max))
        .filter_map(|obs| {
            by_name.get(obs.profile.as_str()).map(|p| CandidateOffer {
                profile: (*p).clone(),
                zone: obs.zone,
                price: obs.price,
            })
        })
        .collect();

    rank(&mut offers, query.sort);
    if let Some(limit) = query.limit {
        offers.truncate(limit);
    }
    tracing::info!("🔎 [discovery] {} candidate offer(s)", offers.len());
    Ok(offers)
}

async fn latest_prices(
    provider: &dyn CloudProvider,
    profiles: &[HardwareProfile],
    cfg: &OrchestratorConfig,
) -> Result<HashMap<(String, String), PriceObservation>> {
    let window = chrono::Duration::from_std(cfg.price_window)
        .map_err(|e| OrchestrateError::Config(format!("price window: {}", e)))?;
    let since = Utc::now() - window;
    let names: Vec<String> = profiles.iter().map(|p| p.name.clone()).collect();

    let mut latest: HashMap<(String, String), PriceObservation> = HashMap::new();
    for batch in names.chunks(cfg.price_batch_size.max(1)) {
        let observations = provider
            .price_history(batch, since)
            .await
            .during("fetch price history")?;
        for obs in observations {
            let key = (obs.profile.clone(), obs.zone.clone());
            match latest.get(&key) {
                Some(existing) if existing.timestamp >= obs.timestamp => {}
                _ => {
                    latest.insert(key, obs);
                }
            }
        }
    }
    Ok(latest)
}

fn rank(offers: &mut [CandidateOffer], sort: SortKey) {
    let by_price = |a: &CandidateOffer, b: &CandidateOffer| {
        a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal)
    };
    offers.sort_by(|a, b| {
        let primary = match sort {
            SortKey::Price => by_price(a, b),
            SortKey::Vcpu => a.profile.vcpus.cmp(&b.profile.vcpus),
            SortKey::Mem => a.profile.memory_mib.cmp(&b.profile.memory_mib),
        };
        primary
            .then_with(|| by_price(a, b))
            .then_with(|| a.profile.name.cmp(&b.profile.name))
            .then_with(|| a.zone.cmp(&b.zone))
    });
}
