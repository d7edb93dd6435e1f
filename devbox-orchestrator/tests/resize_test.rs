// Integration tests for the resize flows (in place and replace-and-migrate)
mod common;

use base64::Engine;
use common::{
    fast_config, on_demand_world, ops, profile, settings, settings_with_dns, spot_world, ZONE,
};
use devbox_common::{InstanceState, MarketRequestState, ProviderError, VolumeState};
use devbox_orchestrator::{Degraded, OrchestrateError, ResizePath, ResizeStep, Resizer};

const STALE_MODULE: &str = "{ config, pkgs, ... }:\n{\n  environment.systemPackages = [ pkgs.git ];\n}\n";

#[tokio::test]
async fn test_on_demand_resize_in_place() {
    let cloud = on_demand_world("i-od", "m6i.large");
    cloud.add_profile(profile("m6i.xlarge", 4, 16, "x86_64"));
    cloud.add_hosted_zone("Z123EXAMPLE");
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings_with_dns(), fast_config());

    let report = Resizer::new(&client, &settings, &cfg)
        .resize("i-od", "m6i.xlarge")
        .await
        .expect("in-place resize should succeed");

    assert_eq!(report.path, ResizePath::InPlace);
    assert_eq!(report.instance_id, "i-od");
    assert_eq!(report.profile, "m6i.xlarge");
    assert!(report.degraded.is_empty(), "unexpected: {:?}", report.degraded);

    let inst = cloud.instance("i-od").expect("instance still exists");
    assert_eq!(inst.state, InstanceState::Running);
    assert_eq!(inst.profile, "m6i.xlarge");
    assert_eq!(
        ops(&cloud),
        vec![
            "stop_instance",
            "modify_instance_profile",
            "start_instance",
            "upsert_dns_record"
        ]
    );
    assert_eq!(cloud.dns_record("dev.example.com"), report.public_ip);
}

#[tokio::test]
async fn test_same_profile_is_a_no_op() {
    let cloud = spot_world("i-orig", "m6i.large");
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());

    let report = Resizer::new(&client, &settings, &cfg)
        .resize("i-orig", "m6i.large")
        .await
        .expect("no-op resize should succeed");

    assert_eq!(report.path, ResizePath::NoOp);
    assert_eq!(report.instance_id, "i-orig");
    assert!(cloud.mutating_calls().is_empty(), "mutations: {:?}", ops(&cloud));
    assert_eq!(
        cloud.instance("i-orig").map(|i| i.state),
        Some(InstanceState::Running)
    );
}

#[tokio::test]
async fn test_spot_resize_replaces_and_migrates_volumes() {
    let cloud = spot_world("i-orig", "m6i.large");
    cloud.add_hosted_zone("Z123EXAMPLE");
    cloud.set_boot_config_blob(
        "i-orig",
        &base64::engine::general_purpose::STANDARD.encode(STALE_MODULE),
    );
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings_with_dns(), fast_config());

    let report = Resizer::new(&client, &settings, &cfg)
        .resize("i-orig", "m6i.2xlarge")
        .await
        .expect("replace-and-migrate should succeed");

    assert_eq!(report.path, ResizePath::ReplaceMigrate);
    assert_eq!(report.original_id, "i-orig");
    assert_ne!(report.instance_id, "i-orig");
    assert_eq!(report.profile, "m6i.2xlarge");
    assert!(report.degraded.is_empty(), "unexpected: {:?}", report.degraded);
    let new_id = report.instance_id.clone();

    // The replacement was launched and seen running before the original was touched.
    let launched = cloud.call_index("launch_instance", None).expect("launch call");
    let confirmed = cloud
        .call_index("describe_instance", Some(&new_id))
        .expect("replacement describe");
    let cancelled = cloud
        .call_index("cancel_market_request", Some("sir-i-orig"))
        .expect("cancel call");
    let terminated = cloud
        .call_index("terminate_instance", Some("i-orig"))
        .expect("terminate call");
    assert!(launched < confirmed && confirmed < cancelled && cancelled < terminated);

    let original = cloud.instance("i-orig").expect("original is still listed");
    assert_eq!(original.state, InstanceState::Terminated);
    assert!(original.attachments.is_empty());
    assert_eq!(
        cloud.market_request("sir-i-orig").map(|r| r.state),
        Some(MarketRequestState::Cancelled)
    );

    let replacement = cloud.instance(&new_id).expect("replacement exists");
    assert_eq!(replacement.state, InstanceState::Running);
    assert!(replacement
        .attachments
        .iter()
        .any(|a| a.volume_id == "vol-1" && a.device == "/dev/xvdf"));
    let data = cloud.volume("vol-1").expect("data volume survives");
    assert_eq!(data.state, VolumeState::InUse);
    assert_eq!(data.attachment.map(|a| a.instance_id), Some(new_id.clone()));

    // Launch parameters carried over: bid, tags minus reserved keys, patched boot config.
    let request_id = replacement.market_request_id.clone().expect("spot request");
    assert_eq!(
        cloud.market_request(&request_id).and_then(|r| r.bid_price),
        Some("0.50".to_string())
    );
    assert_eq!(replacement.tags.get("Name").map(String::as_str), Some("devbox"));
    assert!(replacement.tags.keys().all(|k| !k.starts_with("aws:")));
    let blob = cloud.boot_config(&new_id).expect("boot config pushed");
    let text = String::from_utf8(
        base64::engine::general_purpose::STANDARD
            .decode(blob)
            .expect("valid base64"),
    )
    .expect("utf8 module");
    assert!(text.contains("networking.hostName = \"devbox\";"));
    assert!(text.contains("amazon-image.nix"));

    let steps: Vec<ResizeStep> = report.transitions.iter().map(|t| t.to).collect();
    assert_eq!(steps.first(), Some(&ResizeStep::StopOriginal));
    assert_eq!(steps.last(), Some(&ResizeStep::Done));
    assert!(steps.contains(&ResizeStep::ConfirmCapacity));
    assert_eq!(cloud.dns_record("dev.example.com"), report.public_ip);
}

#[tokio::test]
async fn test_capacity_failure_leaves_original_intact() {
    let cloud = spot_world("i-orig", "m6i.large");
    cloud.deny_capacity("m6i.2xlarge", ZONE);
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());

    let err = Resizer::new(&client, &settings, &cfg)
        .resize("i-orig", "m6i.2xlarge")
        .await
        .expect_err("launch must fail");

    match err {
        OrchestrateError::Provider { source, .. } => {
            assert!(matches!(source, ProviderError::InsufficientCapacity { .. }))
        }
        other => panic!("unexpected error: {other}"),
    }

    // Stopped by step one, but never terminated and still holding its volume.
    let original = cloud.instance("i-orig").expect("original exists");
    assert_eq!(original.state, InstanceState::Stopped);
    assert!(original
        .attachments
        .iter()
        .any(|a| a.volume_id == "vol-1" && a.device == "/dev/xvdf"));
    assert_eq!(
        cloud.volume("vol-1").and_then(|v| v.attachment).map(|a| a.instance_id),
        Some("i-orig".to_string())
    );
    assert_eq!(
        cloud.market_request("sir-i-orig").map(|r| r.state),
        Some(MarketRequestState::Active)
    );
    assert!(cloud.call_index("cancel_market_request", None).is_none());
    assert_eq!(cloud.instances().len(), 1);
}

#[tokio::test]
async fn test_stalled_replacement_aborts_before_touching_original() {
    let cloud = spot_world("i-orig", "m6i.large");
    cloud.stall_launches();
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());

    let err = Resizer::new(&client, &settings, &cfg)
        .resize("i-orig", "m6i.2xlarge")
        .await
        .expect_err("replacement never runs");

    match err {
        OrchestrateError::MigrationAborted {
            step,
            progress,
            source,
        } => {
            assert_eq!(step, ResizeStep::ConfirmCapacity.to_string());
            assert!(progress.original_untouched());
            assert!(progress.replacement_id.is_some());
            assert!(matches!(*source, OrchestrateError::Timeout { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(cloud.call_index("cancel_market_request", None).is_none());
    assert!(cloud.call_index("detach_volume", None).is_none());
}

#[tokio::test]
async fn test_failed_attach_is_reported_as_degraded() {
    let cloud = spot_world("i-orig", "m6i.large");
    cloud.fail_attach("vol-1");
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());

    let report = Resizer::new(&client, &settings, &cfg)
        .resize("i-orig", "m6i.2xlarge")
        .await
        .expect("attach failures are not fatal");

    assert!(report.degraded.iter().any(|d| matches!(
        d,
        Degraded::VolumeAttach { volume_id, device, .. } if volume_id == "vol-1" && device == "/dev/xvdf"
    )));
    assert_eq!(
        cloud.instance(&report.instance_id).map(|i| i.state),
        Some(InstanceState::Running)
    );
    assert_eq!(cloud.volume("vol-1").map(|v| v.state), Some(VolumeState::Available));
}

#[tokio::test]
async fn test_dns_and_boot_config_failures_do_not_fail_resize() {
    let cloud = spot_world("i-orig", "m6i.large");
    cloud.add_hosted_zone("Z123EXAMPLE");
    cloud.set_boot_config_blob(
        "i-orig",
        &base64::engine::general_purpose::STANDARD.encode(STALE_MODULE),
    );
    cloud.fail_dns("rate exceeded");
    cloud.fail_boot_config_push("user data too large");
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings_with_dns(), fast_config());

    let report = Resizer::new(&client, &settings, &cfg)
        .resize("i-orig", "m6i.2xlarge")
        .await
        .expect("best-effort steps are not fatal");

    assert!(report
        .degraded
        .iter()
        .any(|d| matches!(d, Degraded::DnsUpdate { reason } if reason.contains("rate exceeded"))));
    assert!(report
        .degraded
        .iter()
        .any(|d| matches!(d, Degraded::BootConfigPush { .. })));
    assert!(cloud.dns_record("dev.example.com").is_none());
}

#[tokio::test]
async fn test_start_retries_through_consistency_lag() {
    let cloud = on_demand_world("i-od", "m6i.large");
    cloud.add_profile(profile("m6i.xlarge", 4, 16, "x86_64"));
    cloud.fail_next_starts(2);
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());

    let report = Resizer::new(&client, &settings, &cfg)
        .resize("i-od", "m6i.xlarge")
        .await
        .expect("start should succeed on the third attempt");

    assert_eq!(report.profile, "m6i.xlarge");
    let starts = ops(&cloud).iter().filter(|op| *op == "start_instance").count();
    assert_eq!(starts, 3);
}

#[tokio::test]
async fn test_start_gives_up_after_retry_budget() {
    let cloud = on_demand_world("i-od", "m6i.large");
    cloud.add_profile(profile("m6i.xlarge", 4, 16, "x86_64"));
    cloud.fail_next_starts(100);
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());

    let err = Resizer::new(&client, &settings, &cfg)
        .resize("i-od", "m6i.xlarge")
        .await
        .expect_err("start never succeeds");

    assert!(matches!(
        err,
        OrchestrateError::Transient { attempts, .. } if attempts == cfg.start_retry.max_attempts
    ));
}

#[tokio::test]
async fn test_terminated_instance_cannot_be_resized() {
    let cloud = spot_world("i-orig", "m6i.large");
    let client = cloud.client("us-east-2");
    let (settings, cfg) = (settings(), fast_config());
    client_terminate(&client, "i-orig").await;

    let err = Resizer::new(&client, &settings, &cfg)
        .resize("i-orig", "m6i.2xlarge")
        .await
        .expect_err("terminated instances are not resizable");
    assert!(matches!(err, OrchestrateError::InvalidState { .. }));
    assert!(cloud.call_index("launch_instance", None).is_none());
}

async fn client_terminate(client: &devbox_providers::mock::MockProvider, id: &str) {
    use devbox_providers::CloudProvider;
    client.terminate_instance(id).await.expect("terminate");
    // One read to make the shutdown visible, one to finish it.
    client.describe_instance(id).await.expect("describe");
    client.describe_instance(id).await.expect("describe");
}
