use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devbox_common::{
    ComputeResource, CreateVolumeSpec, HardwareProfile, LaunchSpec, MarketRequest,
    PriceObservation, ProfileFilter, ProviderResult, StorageSnapshot, StorageVolume,
};

/// Control-plane surface consumed by the orchestrators.
///
/// Every mutation is asynchronous on the provider side: a call returning `Ok` only means the
/// request was accepted. Callers observe the outcome by re-reading state.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Region this client is scoped to.
    fn region(&self) -> &str;

    /// A second, independent client scoped to another region (cross-region snapshot copy).
    fn for_region(&self, region: &str) -> ProviderResult<Box<dyn CloudProvider>>;

    // Instances
    async fn describe_instance(&self, instance_id: &str) -> ProviderResult<ComputeResource>;
    async fn stop_instance(&self, instance_id: &str) -> ProviderResult<()>;
    async fn start_instance(&self, instance_id: &str) -> ProviderResult<()>;
    async fn terminate_instance(&self, instance_id: &str) -> ProviderResult<()>;

    /// Change the profile of a stopped on-demand instance.
    async fn modify_instance_profile(&self, instance_id: &str, profile: &str)
        -> ProviderResult<()>;

    /// Create a new instance; returns its identity.
    async fn launch_instance(&self, spec: &LaunchSpec) -> ProviderResult<String>;

    /// Base64 boot-configuration blob, if the instance carries one.
    async fn get_boot_config(&self, instance_id: &str) -> ProviderResult<Option<String>>;

    // Optional: replace the boot-configuration blob of a stopped instance.
    // Default is a no-op so providers without user-data support can compile.
    async fn set_boot_config(&self, _instance_id: &str, _blob_b64: &str) -> ProviderResult<bool> {
        Ok(false)
    }

    // Market requests
    async fn describe_market_request(&self, request_id: &str) -> ProviderResult<MarketRequest>;
    async fn cancel_market_request(&self, request_id: &str) -> ProviderResult<()>;

    // Volumes
    async fn describe_volume(&self, volume_id: &str) -> ProviderResult<StorageVolume>;
    async fn find_volumes_by_name(&self, name: &str) -> ProviderResult<Vec<StorageVolume>>;
    async fn create_volume(&self, spec: &CreateVolumeSpec) -> ProviderResult<String>;
    async fn delete_volume(&self, volume_id: &str) -> ProviderResult<()>;
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> ProviderResult<()>;
    async fn detach_volume(&self, volume_id: &str, instance_id: &str) -> ProviderResult<()>;

    // Snapshots
    async fn create_snapshot(&self, volume_id: &str, description: &str) -> ProviderResult<String>;

    /// Copy a snapshot from `source_region` into this client's region.
    async fn copy_snapshot(
        &self,
        source_region: &str,
        source_snapshot_id: &str,
        description: &str,
    ) -> ProviderResult<String>;
    async fn describe_snapshot(&self, snapshot_id: &str) -> ProviderResult<StorageSnapshot>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> ProviderResult<()>;

    // Catalog
    async fn list_hardware_profiles(
        &self,
        filter: &ProfileFilter,
    ) -> ProviderResult<Vec<HardwareProfile>>;

    /// Look up named profiles directly. Unknown names are skipped.
    async fn describe_hardware_profiles(
        &self,
        names: &[String],
    ) -> ProviderResult<Vec<HardwareProfile>>;

    /// Spot price samples for the given profiles since `since`, across all zones of the region.
    async fn price_history(
        &self,
        profiles: &[String],
        since: DateTime<Utc>,
    ) -> ProviderResult<Vec<PriceObservation>>;

    // Optional: upsert an A record (TTL 60). Default implementation returns Ok(false) (not supported).
    async fn upsert_dns_record(
        &self,
        _hosted_zone: &str,
        _name: &str,
        _ip: &str,
    ) -> ProviderResult<bool> {
        Ok(false)
    }
}

#[cfg(feature = "mock")]
pub mod mock;
