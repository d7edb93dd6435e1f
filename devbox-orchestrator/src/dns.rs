use crate::config::DevboxConfig;
use crate::error::Degraded;
use crate::logger;
use devbox_providers::CloudProvider;

/// Point the configured DNS name at the instance's public IP.
///
/// Never fails the caller: any problem comes back as a `Degraded::DnsUpdate`.
pub async fn update_dns_best_effort(
    provider: &dyn CloudProvider,
    instance_id: &str,
    settings: &DevboxConfig,
) -> Option<Degraded> {
    match update_dns(provider, instance_id, settings).await {
        Ok(ip) => {
            tracing::info!(
                "🌐 [dns] {} -> {} ({})",
                settings.dns_name.as_deref().unwrap_or("-"),
                ip,
                instance_id
            );
            None
        }
        Err(reason) => {
            tracing::warn!("⚠️ [dns] DNS update failed: {}", reason);
            tracing::warn!("⚠️ [dns] the boot-time updater on the instance should set it on its own");
            Some(Degraded::DnsUpdate { reason })
        }
    }
}

async fn update_dns(
    provider: &dyn CloudProvider,
    instance_id: &str,
    settings: &DevboxConfig,
) -> Result<String, String> {
    let (Some(name), Some(zone)) = (settings.dns_name.as_deref(), settings.dns_zone.as_deref())
    else {
        return Err("no DNS name or hosted zone configured".to_string());
    };
    let inst = provider
        .describe_instance(instance_id)
        .await
        .map_err(|e| format!("describing instance: {}", e))?;
    let ip = inst
        .public_ip
        .ok_or_else(|| format!("instance {} has no public IP", instance_id))?;

    let metadata = serde_json::json!({ "zone": zone, "name": name, "ip": ip, "ttl": 60 });
    let supported = logger::tracked(
        "DNS_UPSERT",
        instance_id,
        Some(metadata),
        provider.upsert_dns_record(zone, name, &ip),
    )
    .await
    .map_err(|e| format!("updating DNS record: {}", e))?;
    if !supported {
        return Err("provider does not manage DNS records".to_string());
    }
    Ok(ip)
}
