use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod error;

pub use error::{ProviderError, ProviderResult, ResourceKind};

/// Tag set attached to instances, volumes and snapshots. Keys are unique.
pub type Tags = BTreeMap<String, String>;

/// Tag keys starting with this prefix are owned by the provider and cannot be copied.
pub const RESERVED_TAG_PREFIX: &str = "aws:";

pub fn name_tag(tags: &Tags) -> Option<&str> {
    tags.get("Name").map(|s| s.as_str())
}

/// Tags minus the provider-reserved ones.
pub fn user_tags(tags: &Tags) -> Tags {
    tags.iter()
        .filter(|(k, _)| !k.starts_with(RESERVED_TAG_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MarketMode {
    OnDemand,
    SpotPersistent,
}

impl fmt::Display for MarketMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketMode::OnDemand => f.write_str("on-demand"),
            MarketMode::SpotPersistent => f.write_str("spot-persistent"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Error, // Provider gave up on the volume
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::InUse => "in-use",
            VolumeState::Deleting => "deleting",
            VolumeState::Error => "error",
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotState::Pending => f.write_str("pending"),
            SnapshotState::Completed => f.write_str("completed"),
            SnapshotState::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MarketRequestState {
    Open,
    Active,
    Cancelled,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptionBehavior {
    Stop,
    Hibernate,
    Terminate,
}

// --- Entities ---

/// A volume as seen from the instance side: which device path it occupies.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VolumeAttachment {
    pub volume_id: String,
    pub device: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ComputeResource {
    pub id: String,
    pub profile: String,
    pub state: InstanceState,
    pub zone: String,
    pub market: MarketMode,
    #[serde(default)]
    pub market_request_id: Option<String>, // Present iff market == SpotPersistent

    // Launch parameters, needed to recreate an equivalent resource.
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub iam_profile_arn: Option<String>,

    #[serde(default)]
    pub boot_device: Option<String>,
    #[serde(default)]
    pub attachments: Vec<VolumeAttachment>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

impl ComputeResource {
    pub fn name(&self) -> Option<&str> {
        name_tag(&self.tags)
    }

    /// Attachments whose device path differs from the declared boot device.
    pub fn non_root_attachments(&self) -> Vec<VolumeAttachment> {
        self.attachments
            .iter()
            .filter(|a| Some(a.device.as_str()) != self.boot_device.as_deref())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct PerformanceClass {
    pub volume_type: String, // e.g. "gp3", "io2"
    #[serde(default)]
    pub iops: Option<u32>,
    #[serde(default)]
    pub throughput: Option<u32>, // MB/s
}

/// Where an in-use volume is attached.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub instance_id: String,
    pub device: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StorageVolume {
    pub id: String,
    pub size_gib: u32,
    pub performance: PerformanceClass,
    pub zone: String,
    pub state: VolumeState,
    #[serde(default)]
    pub attachment: Option<AttachmentRef>, // Present iff state == InUse
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

impl StorageVolume {
    pub fn name(&self) -> Option<&str> {
        name_tag(&self.tags)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StorageSnapshot {
    pub id: String,
    pub source_volume_id: String,
    pub state: SnapshotState,
    #[serde(default)]
    pub progress: Option<u8>, // Percent
    #[serde(default)]
    pub state_message: Option<String>,
    pub region: String,
    pub size_gib: u32,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MarketRequest {
    pub id: String,
    pub bid_price: Option<String>,
    pub launch_spec: LaunchSpec,
    pub state: MarketRequestState,
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Immutable catalog entry used for candidate filtering.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HardwareProfile {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub architecture: String, // "x86_64" | "arm64"
    #[serde(default)]
    pub has_gpu: bool,
    #[serde(default)]
    pub network_performance: Option<String>,
    #[serde(default = "default_true")]
    pub current_generation: bool,
    #[serde(default = "default_true")]
    pub spot_supported: bool,
}

fn default_true() -> bool {
    true
}

impl HardwareProfile {
    pub fn memory_gib(&self) -> f64 {
        self.memory_mib as f64 / 1024.0
    }
}

/// One spot market price sample for a (profile, zone) pair.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PriceObservation {
    pub profile: String,
    pub zone: String,
    pub price: f64, // $/hr
    pub timestamp: DateTime<Utc>,
}

// --- Requests ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RootVolumeSpec {
    pub device: String,
    pub size_gib: u32,
    pub volume_type: String,
}

impl Default for RootVolumeSpec {
    fn default() -> Self {
        Self {
            device: "/dev/xvda".to_string(),
            size_gib: 75,
            volume_type: "gp3".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum MarketOptions {
    OnDemand,
    Spot {
        max_price: String,
        persistent: bool,
        interruption: InterruptionBehavior,
    },
}

/// Full resource-creation parameters.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LaunchSpec {
    pub image_id: String,
    pub profile: String,
    pub zone: String,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub iam_profile_arn: Option<String>,
    #[serde(default)]
    pub boot_config: Option<String>, // base64
    pub market: MarketOptions,
    #[serde(default)]
    pub root_volume: Option<RootVolumeSpec>,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CreateVolumeSpec {
    pub zone: String,
    pub size_gib: u32,
    pub performance: PerformanceClass,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

/// Catalog-side filter applied by the provider when enumerating profiles.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProfileFilter {
    pub architecture: String,
    pub spot_supported: bool,
    pub current_generation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(boot_device: Option<&str>, attachments: &[(&str, &str)]) -> ComputeResource {
        ComputeResource {
            id: "i-1".to_string(),
            profile: "m6i.large".to_string(),
            state: InstanceState::Running,
            zone: "us-east-2a".to_string(),
            market: MarketMode::OnDemand,
            market_request_id: None,
            image_id: None,
            key_name: None,
            subnet_id: None,
            security_group_ids: vec![],
            iam_profile_arn: None,
            boot_device: boot_device.map(|s| s.to_string()),
            attachments: attachments
                .iter()
                .map(|(v, d)| VolumeAttachment {
                    volume_id: v.to_string(),
                    device: d.to_string(),
                })
                .collect(),
            public_ip: None,
            tags: Tags::new(),
        }
    }

    #[test]
    fn non_root_attachments_skip_boot_device() {
        let inst = instance(
            Some("/dev/xvda"),
            &[("vol-root", "/dev/xvda"), ("vol-data", "/dev/xvdf")],
        );
        let extra = inst.non_root_attachments();
        assert_eq!(extra.len(), 1);
        assert_eq!(extra[0].volume_id, "vol-data");
    }

    #[test]
    fn every_attachment_is_non_root_without_boot_device() {
        let inst = instance(None, &[("vol-a", "/dev/xvda"), ("vol-b", "/dev/xvdf")]);
        assert_eq!(inst.non_root_attachments().len(), 2);
    }

    #[test]
    fn user_tags_drop_reserved_prefix() {
        let mut tags = Tags::new();
        tags.insert("Name".to_string(), "box".to_string());
        tags.insert("aws:ec2spot:fleet-request-id".to_string(), "x".to_string());
        let kept = user_tags(&tags);
        assert_eq!(kept.len(), 1);
        assert_eq!(name_tag(&kept), Some("box"));
    }

    #[test]
    fn states_serialize_kebab_case() {
        let json = serde_json::to_string(&InstanceState::ShuttingDown).unwrap();
        assert_eq!(json, "\"shutting-down\"");
        let v: VolumeState = serde_json::from_str("\"in-use\"").unwrap();
        assert_eq!(v, VolumeState::InUse);
    }
}
