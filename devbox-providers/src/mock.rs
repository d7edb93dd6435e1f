use crate::CloudProvider;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devbox_common::{
    AttachmentRef, ComputeResource, CreateVolumeSpec, HardwareProfile, InstanceState, LaunchSpec,
    MarketMode, MarketOptions, MarketRequest, MarketRequestState, PerformanceClass,
    PriceObservation, ProfileFilter, ProviderError, ProviderResult, ResourceKind, SnapshotState,
    StorageSnapshot, StorageVolume, VolumeAttachment, VolumeState,
};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Region a zone belongs to ("us-east-2a" -> "us-east-2").
pub fn region_of_zone(zone: &str) -> &str {
    zone.trim_end_matches(|c: char| c.is_ascii_lowercase())
}

fn short_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &raw[..17])
}

fn api_error(code: &str, message: impl Into<String>) -> ProviderError {
    ProviderError::Api {
        code: code.to_string(),
        message: message.into(),
    }
}

/// A state change the control plane has accepted but not yet made visible.
#[derive(Debug, Clone)]
struct Settling<S> {
    target: S,
    reads_left: u32,
}

#[derive(Debug, Clone)]
struct MockInstance {
    region: String,
    resource: ComputeResource,
    boot_config: Option<String>,
    settling: Option<Settling<InstanceState>>,
}

#[derive(Debug, Clone)]
enum VolumeChange {
    Ready,
    Attach(AttachmentRef),
    Detach,
    Delete,
}

#[derive(Debug, Clone)]
struct MockVolume {
    region: String,
    volume: StorageVolume,
    settling: Option<Settling<VolumeChange>>,
}

#[derive(Debug, Clone)]
struct MockSnapshot {
    snapshot: StorageSnapshot,
    reads_left: u32,
    failure: Option<String>,
}

/// One recorded control-plane call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub region: String,
    pub op: String,
    pub target: String,
}

impl MockCall {
    pub fn is_mutation(&self) -> bool {
        !(self.op.starts_with("describe")
            || self.op.starts_with("get")
            || self.op.starts_with("list")
            || self.op.starts_with("find")
            || self.op.starts_with("price"))
    }
}

#[derive(Debug, Default)]
struct Faults {
    capacity_denied: HashSet<(String, String)>,
    stall_launches: bool,
    attach_failures: HashSet<String>,
    transient_start_failures: u32,
    snapshot_failures: BTreeMap<String, String>, // source volume id -> state message
    dns_failure: Option<String>,
    boot_config_failure: Option<String>,
}

#[derive(Debug)]
struct World {
    instances: BTreeMap<String, MockInstance>,
    volumes: BTreeMap<String, MockVolume>,
    snapshots: BTreeMap<String, MockSnapshot>,
    market_requests: BTreeMap<String, MarketRequest>,
    profiles: Vec<HardwareProfile>,
    prices: Vec<PriceObservation>,
    hosted_zones: BTreeSet<String>,
    dns_records: BTreeMap<String, String>,
    calls: Vec<MockCall>,
    faults: Faults,
    settle_reads: u32,
    snapshot_reads: u32,
    next_ip: u32,
}

impl Default for World {
    fn default() -> Self {
        Self {
            instances: BTreeMap::new(),
            volumes: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            market_requests: BTreeMap::new(),
            profiles: Vec::new(),
            prices: Vec::new(),
            hosted_zones: BTreeSet::new(),
            dns_records: BTreeMap::new(),
            calls: Vec::new(),
            faults: Faults::default(),
            settle_reads: 1,
            snapshot_reads: 2,
            next_ip: 10,
        }
    }
}

impl World {
    fn record(&mut self, region: &str, op: &str, target: &str) {
        self.calls.push(MockCall {
            region: region.to_string(),
            op: op.to_string(),
            target: target.to_string(),
        });
    }

    fn settling<S>(&self, target: S) -> Option<Settling<S>> {
        Some(Settling {
            target,
            reads_left: self.settle_reads,
        })
    }

    fn instance_mut(&mut self, region: &str, id: &str) -> ProviderResult<&mut MockInstance> {
        match self.instances.get_mut(id) {
            Some(inst) if inst.region == region => Ok(inst),
            _ => Err(ProviderError::not_found(ResourceKind::Instance, id)),
        }
    }

    fn volume_mut(&mut self, region: &str, id: &str) -> ProviderResult<&mut MockVolume> {
        match self.volumes.get_mut(id) {
            Some(vol) if vol.region == region => Ok(vol),
            _ => Err(ProviderError::not_found(ResourceKind::Volume, id)),
        }
    }

    fn allocate_ip(&mut self) -> String {
        self.next_ip += 1;
        format!("203.0.113.{}", self.next_ip)
    }

    /// Make pending instance transitions visible, applying their side effects.
    fn advance_instance(&mut self, id: &str) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        let Some(settling) = inst.settling.as_mut() else {
            return;
        };
        if settling.reads_left > 0 {
            settling.reads_left -= 1;
            return;
        }
        let target = settling.target;
        inst.settling = None;
        inst.resource.state = target;

        match target {
            InstanceState::Running => {
                if inst.resource.public_ip.is_none() {
                    let ip = self.allocate_ip();
                    if let Some(inst) = self.instances.get_mut(id) {
                        inst.resource.public_ip = Some(ip);
                    }
                }
            }
            InstanceState::Stopped => inst.resource.public_ip = None,
            InstanceState::Terminated => self.finish_termination(id),
            _ => {}
        }
    }

    fn finish_termination(&mut self, id: &str) {
        let Some(inst) = self.instances.get_mut(id) else {
            return;
        };
        inst.resource.public_ip = None;
        let boot_device = inst.resource.boot_device.clone();
        let attachments = std::mem::take(&mut inst.resource.attachments);
        let request_id = inst.resource.market_request_id.clone();

        for att in attachments {
            if Some(att.device.as_str()) == boot_device.as_deref() {
                self.volumes.remove(&att.volume_id);
            } else if let Some(vol) = self.volumes.get_mut(&att.volume_id) {
                vol.volume.state = VolumeState::Available;
                vol.volume.attachment = None;
                vol.settling = None;
            }
        }

        // A persistent request that outlives its instance goes back to open and relaunches.
        if let Some(rid) = request_id {
            if let Some(req) = self.market_requests.get_mut(&rid) {
                if req.state != MarketRequestState::Cancelled {
                    req.state = MarketRequestState::Open;
                    req.instance_id = None;
                }
            }
        }
    }

    fn advance_volume(&mut self, id: &str) {
        let Some(vol) = self.volumes.get_mut(id) else {
            return;
        };
        let Some(settling) = vol.settling.as_mut() else {
            return;
        };
        if settling.reads_left > 0 {
            settling.reads_left -= 1;
            return;
        }
        let change = settling.target.clone();
        vol.settling = None;
        match change {
            VolumeChange::Ready => vol.volume.state = VolumeState::Available,
            VolumeChange::Attach(att) => {
                vol.volume.state = VolumeState::InUse;
                vol.volume.attachment = Some(att);
            }
            VolumeChange::Detach => {
                vol.volume.state = VolumeState::Available;
                vol.volume.attachment = None;
            }
            VolumeChange::Delete => {
                self.volumes.remove(id);
            }
        }
    }

    fn advance_snapshot(&mut self, id: &str) {
        let Some(snap) = self.snapshots.get_mut(id) else {
            return;
        };
        if snap.snapshot.state != SnapshotState::Pending {
            return;
        }
        if snap.reads_left > 0 {
            snap.reads_left -= 1;
            let progress = snap.snapshot.progress.unwrap_or(0);
            snap.snapshot.progress = Some(progress.saturating_add(40).min(99));
            return;
        }
        match snap.failure.take() {
            Some(message) => {
                snap.snapshot.state = SnapshotState::Error;
                snap.snapshot.state_message = Some(message);
            }
            None => {
                snap.snapshot.state = SnapshotState::Completed;
                snap.snapshot.progress = Some(100);
            }
        }
    }
}

/// Seed format for `MockCloud::from_json` / `from_file`.
#[derive(Debug, Default, Deserialize)]
pub struct MockInventory {
    #[serde(default)]
    pub instances: Vec<SeedInstance>,
    #[serde(default)]
    pub volumes: Vec<StorageVolume>,
    #[serde(default)]
    pub snapshots: Vec<StorageSnapshot>,
    #[serde(default)]
    pub market_requests: Vec<MarketRequest>,
    #[serde(default)]
    pub profiles: Vec<HardwareProfile>,
    #[serde(default)]
    pub prices: Vec<PriceObservation>,
    #[serde(default)]
    pub hosted_zones: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedInstance {
    #[serde(flatten)]
    pub resource: ComputeResource,
    #[serde(default)]
    pub boot_config: Option<String>,
}

/// Shared simulated cloud. Every regional `MockProvider` handed out by `client()`
/// sees the same world, the way separate regional endpoints see one account.
#[derive(Clone, Default)]
pub struct MockCloud {
    world: Arc<Mutex<World>>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let inventory: MockInventory =
            serde_json::from_str(json).context("parsing mock inventory")?;
        let cloud = Self::new();
        for seed in inventory.instances {
            let id = seed.resource.id.clone();
            cloud.add_instance(seed.resource);
            if let Some(blob) = seed.boot_config {
                cloud.set_boot_config_blob(&id, &blob);
            }
        }
        for vol in inventory.volumes {
            cloud.add_volume(vol);
        }
        for snap in inventory.snapshots {
            cloud.add_snapshot(snap);
        }
        for req in inventory.market_requests {
            cloud.add_market_request(req);
        }
        for profile in inventory.profiles {
            cloud.add_profile(profile);
        }
        for price in inventory.prices {
            cloud.add_price(price);
        }
        for zone in inventory.hosted_zones {
            cloud.add_hosted_zone(&zone);
        }
        Ok(cloud)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading mock inventory {}", path.display()))?;
        Self::from_json(&raw)
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A control-plane client scoped to `region`.
    pub fn client(&self, region: &str) -> MockProvider {
        MockProvider {
            cloud: self.clone(),
            region: region.to_string(),
        }
    }

    // --- Seeding ---

    pub fn add_instance(&self, resource: ComputeResource) {
        let region = region_of_zone(&resource.zone).to_string();
        self.lock().instances.insert(
            resource.id.clone(),
            MockInstance {
                region,
                resource,
                boot_config: None,
                settling: None,
            },
        );
    }

    pub fn set_boot_config_blob(&self, instance_id: &str, blob_b64: &str) {
        if let Some(inst) = self.lock().instances.get_mut(instance_id) {
            inst.boot_config = Some(blob_b64.to_string());
        }
    }

    pub fn add_volume(&self, volume: StorageVolume) {
        let region = region_of_zone(&volume.zone).to_string();
        self.lock().volumes.insert(
            volume.id.clone(),
            MockVolume {
                region,
                volume,
                settling: None,
            },
        );
    }

    pub fn add_snapshot(&self, snapshot: StorageSnapshot) {
        self.lock().snapshots.insert(
            snapshot.id.clone(),
            MockSnapshot {
                snapshot,
                reads_left: 0,
                failure: None,
            },
        );
    }

    pub fn add_market_request(&self, request: MarketRequest) {
        self.lock()
            .market_requests
            .insert(request.id.clone(), request);
    }

    pub fn add_profile(&self, profile: HardwareProfile) {
        self.lock().profiles.push(profile);
    }

    pub fn add_price(&self, price: PriceObservation) {
        self.lock().prices.push(price);
    }

    pub fn add_hosted_zone(&self, zone: &str) {
        self.lock().hosted_zones.insert(zone.to_string());
    }

    /// Number of reads a transition stays invisible for (default 1).
    pub fn set_settle_reads(&self, reads: u32) {
        self.lock().settle_reads = reads;
    }

    // --- Fault injection ---

    pub fn deny_capacity(&self, profile: &str, zone: &str) {
        self.lock()
            .faults
            .capacity_denied
            .insert((profile.to_string(), zone.to_string()));
    }

    /// Launched instances stay `pending` forever.
    pub fn stall_launches(&self) {
        self.lock().faults.stall_launches = true;
    }

    pub fn fail_attach(&self, volume_id: &str) {
        self.lock()
            .faults
            .attach_failures
            .insert(volume_id.to_string());
    }

    /// The next `count` start calls fail with `IncorrectSpotRequestState`.
    pub fn fail_next_starts(&self, count: u32) {
        self.lock().faults.transient_start_failures = count;
    }

    pub fn fail_snapshots_of(&self, volume_id: &str, message: &str) {
        self.lock()
            .faults
            .snapshot_failures
            .insert(volume_id.to_string(), message.to_string());
    }

    pub fn fail_dns(&self, message: &str) {
        self.lock().faults.dns_failure = Some(message.to_string());
    }

    pub fn fail_boot_config_push(&self, message: &str) {
        self.lock().faults.boot_config_failure = Some(message.to_string());
    }

    // --- Inspection (no state advancement, no call recording) ---

    pub fn instance(&self, id: &str) -> Option<ComputeResource> {
        self.lock().instances.get(id).map(|i| i.resource.clone())
    }

    pub fn instances(&self) -> Vec<ComputeResource> {
        self.lock()
            .instances
            .values()
            .map(|i| i.resource.clone())
            .collect()
    }

    pub fn boot_config(&self, instance_id: &str) -> Option<String> {
        self.lock()
            .instances
            .get(instance_id)
            .and_then(|i| i.boot_config.clone())
    }

    pub fn volume(&self, id: &str) -> Option<StorageVolume> {
        self.lock().volumes.get(id).map(|v| v.volume.clone())
    }

    pub fn volumes_in_region(&self, region: &str) -> Vec<StorageVolume> {
        self.lock()
            .volumes
            .values()
            .filter(|v| v.region == region)
            .map(|v| v.volume.clone())
            .collect()
    }

    pub fn snapshot(&self, id: &str) -> Option<StorageSnapshot> {
        self.lock().snapshots.get(id).map(|s| s.snapshot.clone())
    }

    pub fn snapshots(&self) -> Vec<StorageSnapshot> {
        self.lock()
            .snapshots
            .values()
            .map(|s| s.snapshot.clone())
            .collect()
    }

    pub fn market_request(&self, id: &str) -> Option<MarketRequest> {
        self.lock().market_requests.get(id).cloned()
    }

    pub fn dns_record(&self, name: &str) -> Option<String> {
        self.lock().dns_records.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<MockCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    /// Position of the first call matching `op` (and `target`, when given).
    pub fn call_index(&self, op: &str, target: Option<&str>) -> Option<usize> {
        self.lock()
            .calls
            .iter()
            .position(|c| c.op == op && target.map_or(true, |t| c.target == t))
    }
}

/// Regional client over a `MockCloud`.
pub struct MockProvider {
    cloud: MockCloud,
    region: String,
}

impl MockProvider {
    pub fn cloud(&self) -> &MockCloud {
        &self.cloud
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.cloud.lock()
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn region(&self) -> &str {
        &self.region
    }

    fn for_region(&self, region: &str) -> ProviderResult<Box<dyn CloudProvider>> {
        Ok(Box::new(self.cloud.client(region)))
    }

    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<ComputeResource> {
        let mut w = self.world();
        w.record(&self.region, "describe_instance", instance_id);
        w.instance_mut(&self.region, instance_id)?;
        w.advance_instance(instance_id);
        Ok(w.instance_mut(&self.region, instance_id)?.resource.clone())
    }

    async fn stop_instance(&self, instance_id: &str) -> ProviderResult<()> {
        let mut w = self.world();
        w.record(&self.region, "stop_instance", instance_id);
        let settling = w.settling(InstanceState::Stopped);
        let inst = w.instance_mut(&self.region, instance_id)?;
        match inst.resource.state {
            InstanceState::Running | InstanceState::Pending => {
                inst.resource.state = InstanceState::Stopping;
                inst.settling = settling;
                Ok(())
            }
            InstanceState::Stopping | InstanceState::Stopped => Ok(()),
            other => Err(api_error(
                "IncorrectInstanceState",
                format!("instance {} is {}", instance_id, other),
            )),
        }
    }

    async fn start_instance(&self, instance_id: &str) -> ProviderResult<()> {
        let mut w = self.world();
        w.record(&self.region, "start_instance", instance_id);
        w.instance_mut(&self.region, instance_id)?;
        if w.faults.transient_start_failures > 0 {
            w.faults.transient_start_failures -= 1;
            return Err(api_error(
                "IncorrectSpotRequestState",
                "the spot request is not in a state that allows start",
            ));
        }
        let settling = w.settling(InstanceState::Running);
        let inst = w.instance_mut(&self.region, instance_id)?;
        match inst.resource.state {
            InstanceState::Stopped => {
                inst.resource.state = InstanceState::Pending;
                inst.settling = settling;
                Ok(())
            }
            InstanceState::Pending | InstanceState::Running => Ok(()),
            other => Err(api_error(
                "IncorrectInstanceState",
                format!("instance {} is {}", instance_id, other),
            )),
        }
    }

    async fn terminate_instance(&self, instance_id: &str) -> ProviderResult<()> {
        let mut w = self.world();
        w.record(&self.region, "terminate_instance", instance_id);
        let settling = w.settling(InstanceState::Terminated);
        let inst = w.instance_mut(&self.region, instance_id)?;
        if inst.resource.state != InstanceState::Terminated {
            inst.resource.state = InstanceState::ShuttingDown;
            inst.settling = settling;
        }
        Ok(())
    }

    async fn modify_instance_profile(
        &self,
        instance_id: &str,
        profile: &str,
    ) -> ProviderResult<()> {
        let mut w = self.world();
        w.record(&self.region, "modify_instance_profile", instance_id);
        let known = w.profiles.is_empty() || w.profiles.iter().any(|p| p.name == profile);
        if !known {
            return Err(api_error(
                "InvalidInstanceType",
                format!("unknown instance type {}", profile),
            ));
        }
        let inst = w.instance_mut(&self.region, instance_id)?;
        if inst.resource.market != MarketMode::OnDemand {
            return Err(api_error(
                "UnsupportedOperation",
                "instance type of a spot instance cannot be modified",
            ));
        }
        if inst.resource.state != InstanceState::Stopped {
            return Err(api_error(
                "IncorrectInstanceState",
                format!("instance {} is {}", instance_id, inst.resource.state),
            ));
        }
        inst.resource.profile = profile.to_string();
        Ok(())
    }

    async fn launch_instance(&self, spec: &LaunchSpec) -> ProviderResult<String> {
        let mut w = self.world();
        w.record(&self.region, "launch_instance", &spec.profile);
        if region_of_zone(&spec.zone) != self.region {
            return Err(api_error(
                "InvalidParameterValue",
                format!("zone {} is not in {}", spec.zone, self.region),
            ));
        }
        if w
            .faults
            .capacity_denied
            .contains(&(spec.profile.clone(), spec.zone.clone()))
        {
            tracing::warn!("🧪 [mock] no capacity for {} in {}", spec.profile, spec.zone);
            return Err(ProviderError::InsufficientCapacity {
                profile: spec.profile.clone(),
                zone: spec.zone.clone(),
            });
        }

        let id = short_id("i");
        let mut attachments = Vec::new();
        let boot_device = spec.root_volume.as_ref().map(|r| r.device.clone());
        if let Some(root) = &spec.root_volume {
            let vol_id = short_id("vol");
            w.volumes.insert(
                vol_id.clone(),
                MockVolume {
                    region: self.region.clone(),
                    volume: StorageVolume {
                        id: vol_id.clone(),
                        size_gib: root.size_gib,
                        performance: PerformanceClass {
                            volume_type: root.volume_type.clone(),
                            iops: None,
                            throughput: None,
                        },
                        zone: spec.zone.clone(),
                        state: VolumeState::InUse,
                        attachment: Some(AttachmentRef {
                            instance_id: id.clone(),
                            device: root.device.clone(),
                        }),
                        snapshot_id: None,
                        tags: Default::default(),
                    },
                    settling: None,
                },
            );
            attachments.push(VolumeAttachment {
                volume_id: vol_id,
                device: root.device.clone(),
            });
        }

        let (market, market_request_id) = match &spec.market {
            MarketOptions::OnDemand => (MarketMode::OnDemand, None),
            MarketOptions::Spot { max_price, .. } => {
                let rid = short_id("sir");
                w.market_requests.insert(
                    rid.clone(),
                    MarketRequest {
                        id: rid.clone(),
                        bid_price: Some(max_price.clone()),
                        launch_spec: spec.clone(),
                        state: MarketRequestState::Active,
                        instance_id: Some(id.clone()),
                    },
                );
                (MarketMode::SpotPersistent, Some(rid))
            }
        };

        let settling = if w.faults.stall_launches {
            None
        } else {
            w.settling(InstanceState::Running)
        };
        w.instances.insert(
            id.clone(),
            MockInstance {
                region: self.region.clone(),
                resource: ComputeResource {
                    id: id.clone(),
                    profile: spec.profile.clone(),
                    state: InstanceState::Pending,
                    zone: spec.zone.clone(),
                    market,
                    market_request_id,
                    image_id: Some(spec.image_id.clone()),
                    key_name: spec.key_name.clone(),
                    subnet_id: spec.subnet_id.clone(),
                    security_group_ids: spec.security_group_ids.clone(),
                    iam_profile_arn: spec.iam_profile_arn.clone(),
                    boot_device,
                    attachments,
                    public_ip: None,
                    tags: spec.tags.clone(),
                },
                boot_config: spec.boot_config.clone(),
                settling,
            },
        );
        tracing::info!("🧪 [mock] launched {} ({}) in {}", id, spec.profile, spec.zone);
        Ok(id)
    }

    async fn get_boot_config(&self, instance_id: &str) -> ProviderResult<Option<String>> {
        let mut w = self.world();
        w.record(&self.region, "get_boot_config", instance_id);
        Ok(w.instance_mut(&self.region, instance_id)?.boot_config.clone())
    }

    async fn set_boot_config(&self, instance_id: &str, blob_b64: &str) -> ProviderResult<bool> {
        let mut w = self.world();
        w.record(&self.region, "set_boot_config", instance_id);
        if let Some(message) = w.faults.boot_config_failure.clone() {
            return Err(api_error("InvalidParameterValue", message));
        }
        let inst = w.instance_mut(&self.region, instance_id)?;
        if inst.resource.state != InstanceState::Stopped {
            return Err(api_error(
                "IncorrectInstanceState",
                format!("instance {} must be stopped", instance_id),
            ));
        }
        inst.boot_config = Some(blob_b64.to_string());
        Ok(true)
    }

    async fn describe_market_request(&self, request_id: &str) -> ProviderResult<MarketRequest> {
        let mut w = self.world();
        w.record(&self.region, "describe_market_request", request_id);
        w.market_requests
            .get(request_id)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(ResourceKind::MarketRequest, request_id))
    }

    async fn cancel_market_request(&self, request_id: &str) -> ProviderResult<()> {
        let mut w = self.world();
        w.record(&self.region, "cancel_market_request", request_id);
        let req = w
            .market_requests
            .get_mut(request_id)
            .ok_or_else(|| ProviderError::not_found(ResourceKind::MarketRequest, request_id))?;
        req.state = MarketRequestState::Cancelled;
        Ok(())
    }

    async fn describe_volume(&self, volume_id: &str) -> ProviderResult<StorageVolume> {
        let mut w = self.world();
        w.record(&self.region, "describe_volume", volume_id);
        w.volume_mut(&self.region, volume_id)?;
        w.advance_volume(volume_id);
        Ok(w.volume_mut(&self.region, volume_id)?.volume.clone())
    }

    async fn find_volumes_by_name(&self, name: &str) -> ProviderResult<Vec<StorageVolume>> {
        let mut w = self.world();
        w.record(&self.region, "find_volumes_by_name", name);
        Ok(w.volumes
            .values()
            .filter(|v| v.region == self.region && v.volume.name() == Some(name))
            .map(|v| v.volume.clone())
            .collect())
    }

    async fn create_volume(&self, spec: &CreateVolumeSpec) -> ProviderResult<String> {
        let mut w = self.world();
        w.record(&self.region, "create_volume", &spec.zone);
        if region_of_zone(&spec.zone) != self.region {
            return Err(api_error(
                "InvalidParameterValue",
                format!("zone {} is not in {}", spec.zone, self.region),
            ));
        }
        if let Some(snap_id) = &spec.snapshot_id {
            match w.snapshots.get(snap_id) {
                Some(s) if s.snapshot.region == self.region => {
                    if s.snapshot.state != SnapshotState::Completed {
                        return Err(api_error(
                            "IncorrectState",
                            format!("snapshot {} is {}", snap_id, s.snapshot.state),
                        ));
                    }
                }
                _ => return Err(ProviderError::not_found(ResourceKind::Snapshot, snap_id)),
            }
        }
        let id = short_id("vol");
        let settling = w.settling(VolumeChange::Ready);
        w.volumes.insert(
            id.clone(),
            MockVolume {
                region: self.region.clone(),
                volume: StorageVolume {
                    id: id.clone(),
                    size_gib: spec.size_gib,
                    performance: spec.performance.clone(),
                    zone: spec.zone.clone(),
                    state: VolumeState::Creating,
                    attachment: None,
                    snapshot_id: spec.snapshot_id.clone(),
                    tags: spec.tags.clone(),
                },
                settling,
            },
        );
        Ok(id)
    }

    async fn delete_volume(&self, volume_id: &str) -> ProviderResult<()> {
        let mut w = self.world();
        w.record(&self.region, "delete_volume", volume_id);
        let settling = w.settling(VolumeChange::Delete);
        let vol = w.volume_mut(&self.region, volume_id)?;
        if vol.volume.state != VolumeState::Available {
            return Err(api_error(
                "VolumeInUse",
                format!("volume {} is {}", volume_id, vol.volume.state),
            ));
        }
        vol.volume.state = VolumeState::Deleting;
        vol.settling = settling;
        Ok(())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> ProviderResult<()> {
        let mut w = self.world();
        w.record(&self.region, "attach_volume", volume_id);
        if w.faults.attach_failures.contains(volume_id) {
            return Err(api_error(
                "InvalidParameterValue",
                format!("cannot attach {} at {}", volume_id, device),
            ));
        }
        let instance_zone = {
            let inst = w.instance_mut(&self.region, instance_id)?;
            if !matches!(
                inst.resource.state,
                InstanceState::Running | InstanceState::Stopped
            ) {
                return Err(api_error(
                    "IncorrectState",
                    format!("instance {} is {}", instance_id, inst.resource.state),
                ));
            }
            inst.resource.zone.clone()
        };
        let settling = w.settling(VolumeChange::Attach(AttachmentRef {
            instance_id: instance_id.to_string(),
            device: device.to_string(),
        }));
        let vol = w.volume_mut(&self.region, volume_id)?;
        if vol.volume.state != VolumeState::Available || vol.settling.is_some() {
            return Err(api_error(
                "VolumeInUse",
                format!("volume {} is {}", volume_id, vol.volume.state),
            ));
        }
        if vol.volume.zone != instance_zone {
            return Err(api_error(
                "InvalidVolume.ZoneMismatch",
                format!(
                    "volume {} is in {}, instance is in {}",
                    volume_id, vol.volume.zone, instance_zone
                ),
            ));
        }
        vol.settling = settling;
        let inst = w.instance_mut(&self.region, instance_id)?;
        inst.resource.attachments.push(VolumeAttachment {
            volume_id: volume_id.to_string(),
            device: device.to_string(),
        });
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> ProviderResult<()> {
        let mut w = self.world();
        w.record(&self.region, "detach_volume", volume_id);
        let settling = w.settling(VolumeChange::Detach);
        let vol = w.volume_mut(&self.region, volume_id)?;
        let attached_here = vol
            .volume
            .attachment
            .as_ref()
            .map_or(false, |a| a.instance_id == instance_id);
        if vol.volume.state != VolumeState::InUse || !attached_here {
            return Err(api_error(
                "IncorrectState",
                format!("volume {} is not attached to {}", volume_id, instance_id),
            ));
        }
        vol.settling = settling;
        let inst = w.instance_mut(&self.region, instance_id)?;
        inst.resource.attachments.retain(|a| a.volume_id != volume_id);
        Ok(())
    }

    async fn create_snapshot(&self, volume_id: &str, description: &str) -> ProviderResult<String> {
        let mut w = self.world();
        w.record(&self.region, "create_snapshot", volume_id);
        let size_gib = w.volume_mut(&self.region, volume_id)?.volume.size_gib;
        let failure = w.faults.snapshot_failures.get(volume_id).cloned();
        let id = short_id("snap");
        let reads_left = w.snapshot_reads;
        w.snapshots.insert(
            id.clone(),
            MockSnapshot {
                snapshot: StorageSnapshot {
                    id: id.clone(),
                    source_volume_id: volume_id.to_string(),
                    state: SnapshotState::Pending,
                    progress: Some(0),
                    state_message: None,
                    region: self.region.clone(),
                    size_gib,
                    description: Some(description.to_string()),
                },
                reads_left,
                failure,
            },
        );
        Ok(id)
    }

    async fn copy_snapshot(
        &self,
        source_region: &str,
        source_snapshot_id: &str,
        description: &str,
    ) -> ProviderResult<String> {
        let mut w = self.world();
        w.record(&self.region, "copy_snapshot", source_snapshot_id);
        let source = match w.snapshots.get(source_snapshot_id) {
            Some(s) if s.snapshot.region == source_region => s.snapshot.clone(),
            _ => {
                return Err(ProviderError::not_found(
                    ResourceKind::Snapshot,
                    source_snapshot_id,
                ))
            }
        };
        if source.state != SnapshotState::Completed {
            return Err(api_error(
                "IncorrectState",
                format!("snapshot {} is {}", source_snapshot_id, source.state),
            ));
        }
        let id = short_id("snap");
        let reads_left = w.snapshot_reads;
        w.snapshots.insert(
            id.clone(),
            MockSnapshot {
                snapshot: StorageSnapshot {
                    id: id.clone(),
                    source_volume_id: source.source_volume_id,
                    state: SnapshotState::Pending,
                    progress: Some(0),
                    state_message: None,
                    region: self.region.clone(),
                    size_gib: source.size_gib,
                    description: Some(description.to_string()),
                },
                reads_left,
                failure: None,
            },
        );
        Ok(id)
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> ProviderResult<StorageSnapshot> {
        let mut w = self.world();
        w.record(&self.region, "describe_snapshot", snapshot_id);
        match w.snapshots.get(snapshot_id) {
            Some(s) if s.snapshot.region == self.region => {}
            _ => return Err(ProviderError::not_found(ResourceKind::Snapshot, snapshot_id)),
        }
        w.advance_snapshot(snapshot_id);
        w.snapshots
            .get(snapshot_id)
            .map(|s| s.snapshot.clone())
            .ok_or_else(|| ProviderError::not_found(ResourceKind::Snapshot, snapshot_id))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> ProviderResult<()> {
        let mut w = self.world();
        w.record(&self.region, "delete_snapshot", snapshot_id);
        match w.snapshots.get(snapshot_id) {
            Some(s) if s.snapshot.region == self.region => {
                w.snapshots.remove(snapshot_id);
                Ok(())
            }
            _ => Err(ProviderError::not_found(ResourceKind::Snapshot, snapshot_id)),
        }
    }

    async fn list_hardware_profiles(
        &self,
        filter: &ProfileFilter,
    ) -> ProviderResult<Vec<HardwareProfile>> {
        let mut w = self.world();
        w.record(&self.region, "list_hardware_profiles", &filter.architecture);
        Ok(w.profiles
            .iter()
            .filter(|p| p.architecture == filter.architecture)
            .filter(|p| !filter.spot_supported || p.spot_supported)
            .filter(|p| !filter.current_generation || p.current_generation)
            .cloned()
            .collect())
    }

    async fn describe_hardware_profiles(
        &self,
        names: &[String],
    ) -> ProviderResult<Vec<HardwareProfile>> {
        let mut w = self.world();
        w.record(&self.region, "describe_hardware_profiles", &names.join(","));
        Ok(w.profiles
            .iter()
            .filter(|p| names.contains(&p.name))
            .cloned()
            .collect())
    }

    async fn price_history(
        &self,
        profiles: &[String],
        since: DateTime<Utc>,
    ) -> ProviderResult<Vec<PriceObservation>> {
        let mut w = self.world();
        w.record(&self.region, "price_history", &profiles.len().to_string());
        Ok(w.prices
            .iter()
            .filter(|p| profiles.contains(&p.profile))
            .filter(|p| p.timestamp >= since)
            .filter(|p| region_of_zone(&p.zone) == self.region)
            .cloned()
            .collect())
    }

    async fn upsert_dns_record(
        &self,
        hosted_zone: &str,
        name: &str,
        ip: &str,
    ) -> ProviderResult<bool> {
        let mut w = self.world();
        w.record(&self.region, "upsert_dns_record", name);
        if let Some(message) = w.faults.dns_failure.clone() {
            return Err(api_error("Throttling", message));
        }
        if !w.hosted_zones.contains(hosted_zone) {
            return Err(ProviderError::not_found(
                ResourceKind::HostedZone,
                hosted_zone,
            ));
        }
        w.dns_records.insert(name.to_string(), ip.to_string());
        Ok(true)
    }
}
