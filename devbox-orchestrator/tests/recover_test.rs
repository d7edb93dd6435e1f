// Integration tests for recovery planning of instances stuck without capacity
mod common;

use common::{fast_config, price, profile, settings, spot_world, ZONE};
use devbox_common::ResourceKind;
use devbox_orchestrator::{
    DevboxConfig, OrchestrateError, RecoveryOptions, RecoveryPlanner, ResizePath,
};
use devbox_providers::mock::MockCloud;

/// `i-stuck` runs m6i.4xlarge (16 vCPU, 64 GiB) in us-east-2a.
fn stuck_world() -> MockCloud {
    let cloud = spot_world("i-stuck", "m6i.4xlarge");
    cloud.add_profile(profile("m6i.4xlarge", 16, 64, "x86_64"));
    cloud.add_profile(profile("m6i.2xlarge", 8, 32, "x86_64"));
    cloud.add_profile(profile("m6a.2xlarge", 8, 32, "x86_64"));
    cloud.add_profile(profile("r6i.2xlarge", 8, 64, "x86_64"));
    cloud.add_profile(profile("c6i.2xlarge", 8, 16, "x86_64"));
    cloud.add_profile(profile("m7g.2xlarge", 8, 32, "arm64"));

    price(&cloud, "m6i.4xlarge", ZONE, 0.30, 5);
    price(&cloud, "m6i.2xlarge", ZONE, 0.20, 5);
    price(&cloud, "m6a.2xlarge", ZONE, 0.15, 5);
    price(&cloud, "m6a.2xlarge", "us-east-2b", 0.05, 5);
    price(&cloud, "r6i.2xlarge", ZONE, 0.25, 5);
    price(&cloud, "r6i.2xlarge", "us-east-2c", 0.02, 5);
    price(&cloud, "c6i.2xlarge", ZONE, 0.08, 5);
    price(&cloud, "m7g.2xlarge", ZONE, 0.07, 5);
    cloud
}

#[tokio::test]
async fn test_recovery_defaults_to_half_size_in_same_zone() {
    let cloud = stuck_world();
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());

    let plan = RecoveryPlanner::new(&client, &settings, &cfg)
        .plan("i-stuck", &RecoveryOptions::default())
        .await
        .expect("planning should succeed");

    assert_eq!(plan.zone, ZONE);
    assert_eq!(plan.constraints.min_vcpus, 8);
    assert_eq!(plan.constraints.min_memory_gib, 32.0);
    assert_eq!(plan.constraints.architecture, "x86_64");
    assert_eq!(plan.max_price, Some(2.0));

    let names: Vec<&str> = plan.candidates.iter().map(|c| c.profile.name.as_str()).collect();
    assert_eq!(names, vec!["m6a.2xlarge", "m6i.2xlarge", "r6i.2xlarge"]);
    // Cheaper offers elsewhere are never proposed: the volumes cannot follow.
    assert!(plan.candidates.iter().all(|c| c.zone == ZONE));
    assert!(cloud.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_recovery_overrides_and_price_ceiling() {
    let cloud = stuck_world();
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());
    let opts = RecoveryOptions {
        min_memory_gib: Some(48.0),
        max_price: Some(0.26),
        ..RecoveryOptions::default()
    };

    let plan = RecoveryPlanner::new(&client, &settings, &cfg)
        .plan("i-stuck", &opts)
        .await
        .expect("planning should succeed");

    let names: Vec<&str> = plan.candidates.iter().map(|c| c.profile.name.as_str()).collect();
    assert_eq!(names, vec!["r6i.2xlarge"]);
}

#[tokio::test]
async fn test_auto_confirm_resizes_to_cheapest() {
    let cloud = stuck_world();
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());
    let opts = RecoveryOptions {
        auto_confirm: true,
        ..RecoveryOptions::default()
    };

    let report = RecoveryPlanner::new(&client, &settings, &cfg)
        .recover("i-stuck", &opts)
        .await
        .expect("recovery should succeed");

    let resize = report.resize.expect("auto-confirm resizes");
    assert_eq!(resize.path, ResizePath::ReplaceMigrate);
    assert_eq!(resize.profile, "m6a.2xlarge");
    let replacement = cloud.instance(&resize.instance_id).expect("replacement exists");
    assert_eq!(replacement.zone, ZONE);
    assert!(replacement.attachments.iter().any(|a| a.volume_id == "vol-1"));
}

#[tokio::test]
async fn test_no_candidates_means_no_resize() {
    let cloud = stuck_world();
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());
    let opts = RecoveryOptions {
        min_vcpus: Some(16),
        auto_confirm: true,
        ..RecoveryOptions::default()
    };

    let report = RecoveryPlanner::new(&client, &settings, &cfg)
        .recover("i-stuck", &opts)
        .await
        .expect("an empty plan is not an error");

    assert!(report.plan.candidates.is_empty());
    assert!(report.resize.is_none());
    assert!(cloud.mutating_calls().is_empty());
}

#[tokio::test]
async fn test_unknown_current_profile_is_not_found() {
    let cloud = spot_world("i-stuck", "x9.mystery");
    cloud.add_profile(profile("m6i.2xlarge", 8, 32, "x86_64"));
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());

    let err = RecoveryPlanner::new(&client, &settings, &cfg)
        .plan("i-stuck", &RecoveryOptions::default())
        .await
        .expect_err("profile is not in the catalog");
    assert!(matches!(
        err,
        OrchestrateError::NotFound { kind: ResourceKind::Profile, ref id } if id == "x9.mystery"
    ));
}

#[tokio::test]
async fn test_invalid_default_price_is_a_config_error() {
    let cloud = stuck_world();
    let client = cloud.client("us-east-2");
    let settings = DevboxConfig {
        default_max_price: "cheap".to_string(),
        ..settings()
    };
    let cfg = fast_config();

    let err = RecoveryPlanner::new(&client, &settings, &cfg)
        .plan("i-stuck", &RecoveryOptions::default())
        .await
        .expect_err("price must be numeric");
    assert!(matches!(err, OrchestrateError::Config(_)));
}
