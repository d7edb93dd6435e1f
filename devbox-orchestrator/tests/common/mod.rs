// Shared fixtures for the orchestrator integration tests.
// Everything runs against the in-process mock cloud; no test talks to a real control plane.
#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use devbox_common::{
    AttachmentRef, ComputeResource, HardwareProfile, InstanceState, LaunchSpec, MarketMode,
    MarketOptions, MarketRequest, MarketRequestState, PerformanceClass, PriceObservation,
    InterruptionBehavior, StorageVolume, Tags, VolumeAttachment, VolumeState,
};
use devbox_orchestrator::{DevboxConfig, OrchestratorConfig, RetryPolicy};
use devbox_providers::mock::MockCloud;
use std::time::Duration;

pub const REGION: &str = "us-east-2";
pub const ZONE: &str = "us-east-2a";

/// Millisecond cadence so the flows finish quickly against the mock.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        instance_poll: Duration::from_millis(2),
        volume_poll: Duration::from_millis(2),
        snapshot_poll: Duration::from_millis(2),
        instance_timeout: Duration::from_millis(500),
        volume_timeout: Duration::from_millis(500),
        snapshot_timeout: Duration::from_millis(500),
        start_retry: RetryPolicy::new(4, Duration::from_millis(2)),
        price_window: Duration::from_secs(60 * 60),
        price_batch_size: 2,
    }
}

pub fn settings() -> DevboxConfig {
    DevboxConfig {
        region: REGION.to_string(),
        default_az: ZONE.to_string(),
        ..DevboxConfig::default()
    }
}

pub fn settings_with_dns() -> DevboxConfig {
    DevboxConfig {
        dns_name: Some("dev.example.com".to_string()),
        dns_zone: Some("Z123EXAMPLE".to_string()),
        ..settings()
    }
}

pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn instance(id: &str, profile: &str, market: MarketMode) -> ComputeResource {
    ComputeResource {
        id: id.to_string(),
        profile: profile.to_string(),
        state: InstanceState::Running,
        zone: ZONE.to_string(),
        market,
        market_request_id: None,
        image_id: Some("ami-0devbox".to_string()),
        key_name: Some("devbox".to_string()),
        subnet_id: Some("subnet-1".to_string()),
        security_group_ids: vec!["sg-1".to_string()],
        iam_profile_arn: None,
        boot_device: Some("/dev/xvda".to_string()),
        attachments: vec![VolumeAttachment {
            volume_id: format!("{}-root", id),
            device: "/dev/xvda".to_string(),
        }],
        public_ip: Some("198.51.100.7".to_string()),
        tags: tags(&[("Name", "devbox"), ("aws:ec2spot:fleet-request-id", "sfr-1")]),
    }
}

pub fn volume(id: &str, zone: &str, size_gib: u32) -> StorageVolume {
    StorageVolume {
        id: id.to_string(),
        size_gib,
        performance: PerformanceClass {
            volume_type: "gp3".to_string(),
            iops: Some(6000),
            throughput: Some(250),
        },
        zone: zone.to_string(),
        state: VolumeState::Available,
        attachment: None,
        snapshot_id: None,
        tags: Tags::new(),
    }
}

/// Attach `vol` to `inst` at `device` on both sides of the seed.
pub fn attach(inst: &mut ComputeResource, vol: &mut StorageVolume, device: &str) {
    inst.attachments.push(VolumeAttachment {
        volume_id: vol.id.clone(),
        device: device.to_string(),
    });
    vol.state = VolumeState::InUse;
    vol.attachment = Some(AttachmentRef {
        instance_id: inst.id.clone(),
        device: device.to_string(),
    });
}

fn seed_root(cloud: &MockCloud, inst: &ComputeResource) {
    let mut root = volume(&format!("{}-root", inst.id), &inst.zone, 75);
    root.state = VolumeState::InUse;
    root.attachment = Some(AttachmentRef {
        instance_id: inst.id.clone(),
        device: "/dev/xvda".to_string(),
    });
    cloud.add_volume(root);
}

pub fn profile(name: &str, vcpus: u32, memory_gib: u64, arch: &str) -> HardwareProfile {
    HardwareProfile {
        name: name.to_string(),
        vcpus,
        memory_mib: memory_gib * 1024,
        architecture: arch.to_string(),
        has_gpu: false,
        network_performance: Some("Up to 12.5 Gigabit".to_string()),
        current_generation: true,
        spot_supported: true,
    }
}

pub fn price(cloud: &MockCloud, profile: &str, zone: &str, price: f64, minutes_ago: i64) {
    cloud.add_price(PriceObservation {
        profile: profile.to_string(),
        zone: zone.to_string(),
        price,
        timestamp: Utc::now() - ChronoDuration::minutes(minutes_ago),
    });
}

/// A running on-demand instance with its root volume.
pub fn on_demand_world(id: &str, profile: &str) -> MockCloud {
    let cloud = MockCloud::new();
    let inst = instance(id, profile, MarketMode::OnDemand);
    seed_root(&cloud, &inst);
    cloud.add_instance(inst);
    cloud.add_profile(self::profile(profile, 2, 8, "x86_64"));
    cloud
}

/// A running spot-persistent instance with a root volume, a data volume `vol-1`
/// at /dev/xvdf and an active market request bidding 0.50.
pub fn spot_world(id: &str, profile: &str) -> MockCloud {
    let cloud = MockCloud::new();
    let mut inst = instance(id, profile, MarketMode::SpotPersistent);
    let request_id = format!("sir-{}", id);
    inst.market_request_id = Some(request_id.clone());

    let mut data = volume("vol-1", ZONE, 200);
    data.tags = tags(&[("Name", "home")]);
    attach(&mut inst, &mut data, "/dev/xvdf");
    seed_root(&cloud, &inst);
    cloud.add_volume(data);

    cloud.add_market_request(MarketRequest {
        id: request_id,
        bid_price: Some("0.50".to_string()),
        launch_spec: LaunchSpec {
            image_id: "ami-0devbox".to_string(),
            profile: profile.to_string(),
            zone: ZONE.to_string(),
            key_name: None,
            subnet_id: None,
            security_group_ids: vec![],
            iam_profile_arn: None,
            boot_config: None,
            market: MarketOptions::Spot {
                max_price: "0.50".to_string(),
                persistent: true,
                interruption: InterruptionBehavior::Stop,
            },
            root_volume: None,
            tags: Tags::new(),
        },
        state: MarketRequestState::Active,
        instance_id: Some(id.to_string()),
    });
    cloud.add_instance(inst);
    cloud
}

pub fn ops(cloud: &MockCloud) -> Vec<String> {
    cloud.mutating_calls().into_iter().map(|c| c.op).collect()
}
