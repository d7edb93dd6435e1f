pub mod boot_config;
pub mod config;
pub mod discovery;
pub mod dns;
pub mod error;
pub mod logger;
pub mod poller;
pub mod provider_manager;
pub mod recover;
pub mod resize;
pub mod retry;
pub mod state_machine;
pub mod volume_move;

pub use config::{DevboxConfig, OrchestratorConfig};
pub use discovery::{find_candidates, CandidateOffer, CandidateQuery, HardwareConstraints, ProfileSelector, SortKey};
pub use error::{Degraded, OrchestrateError, Result};
pub use recover::{RecoveryOptions, RecoveryPlan, RecoveryPlanner, RecoveryReport};
pub use resize::{ResizePath, ResizeReport, Resizer};
pub use retry::RetryPolicy;
pub use state_machine::{MigrationProgress, ResizeStep};
pub use volume_move::{VolumeMoveReport, VolumeMoveRequest, VolumeRelocationOrchestrator};
