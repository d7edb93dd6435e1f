use crate::error::{OrchestrateError, Result};
use devbox_providers::CloudProvider;
use std::env;

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name() -> String {
        env::var("PROVIDER")
            .map(|s| s.trim().to_lowercase())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "mock".to_string())
    }

    /// A control-plane client for `region`.
    pub fn get_provider(provider_name: &str, region: &str) -> Result<Box<dyn CloudProvider>> {
        match provider_name.to_lowercase().as_str() {
            "mock" => Self::mock(region),
            // Add other providers here:
            // "aws" => ...
            other => Err(OrchestrateError::Config(format!(
                "unknown provider {:?}",
                other
            ))),
        }
    }

    #[cfg(feature = "provider-mock")]
    fn mock(region: &str) -> Result<Box<dyn CloudProvider>> {
        use devbox_providers::mock::MockCloud;

        // Seed the simulator from a JSON inventory when one is given.
        let cloud = match env::var("MOCK_INVENTORY_FILE") {
            Ok(path) if !path.trim().is_empty() => MockCloud::from_file(path.trim())
                .map_err(|e| OrchestrateError::Config(format!("{:#}", e)))?,
            _ => MockCloud::new(),
        };
        Ok(Box::new(cloud.client(region)))
    }

    #[cfg(not(feature = "provider-mock"))]
    fn mock(_region: &str) -> Result<Box<dyn CloudProvider>> {
        Err(OrchestrateError::Config(
            "built without the provider-mock feature".to_string(),
        ))
    }
}
