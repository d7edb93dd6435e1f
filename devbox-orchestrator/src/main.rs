use anyhow::Context;
use clap::{Parser, Subcommand};
use devbox_orchestrator::provider_manager::ProviderManager;
use devbox_orchestrator::{
    find_candidates, CandidateOffer, CandidateQuery, DevboxConfig, HardwareConstraints,
    OrchestratorConfig, ProfileSelector, RecoveryOptions, RecoveryPlanner, ResizeReport, Resizer,
    SortKey, VolumeMoveRequest, VolumeRelocationOrchestrator,
};
use devbox_providers::CloudProvider;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devbox-orchestrator", about = "Resize, recover and relocate a cloud workstation")]
struct Cli {
    /// Region of the workstation (overrides config and DEVBOX_REGION)
    #[arg(long, global = true, value_name = "REGION")]
    region: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Change an instance's profile (in place for on-demand, replace-and-migrate for spot)
    Resize {
        #[arg(value_name = "INSTANCE_ID")]
        instance_id: String,
        #[arg(value_name = "PROFILE")]
        profile: String,
    },

    /// Find cheaper or available alternatives for an instance stuck without capacity
    Recover {
        #[arg(value_name = "INSTANCE_ID")]
        instance_id: String,
        /// Minimum vCPUs (default: half of the current profile)
        #[arg(long, value_name = "N")]
        min_vcpu: Option<u32>,
        /// Minimum memory in GiB (default: half of the current profile)
        #[arg(long, value_name = "GIB")]
        min_mem: Option<f64>,
        /// Maximum spot price in $/hr (default: default_max_price from config)
        #[arg(long, value_name = "PRICE")]
        max_price: Option<f64>,
        /// Resize to the cheapest candidate without asking
        #[arg(long)]
        yes: bool,
    },

    /// Search spot offers by hardware constraints or explicit profile names
    Search {
        #[arg(value_name = "PROFILE")]
        profiles: Vec<String>,
        #[arg(long, default_value_t = 8, value_name = "N")]
        min_vcpu: u32,
        #[arg(long, default_value_t = 16.0, value_name = "GIB")]
        min_mem: f64,
        #[arg(long, value_name = "PRICE")]
        max_price: Option<f64>,
        #[arg(long, default_value = "x86_64", value_name = "ARCH")]
        arch: String,
        #[arg(long)]
        gpu: bool,
        #[arg(long, value_name = "ZONE")]
        az: Option<String>,
        /// price, vcpu or mem
        #[arg(long, default_value = "price", value_name = "KEY")]
        sort: String,
        #[arg(long, default_value_t = 20, value_name = "N")]
        limit: usize,
    },

    /// Move a volume to another region through a snapshot copy
    VolumeMove {
        /// Volume id or Name tag
        #[arg(value_name = "VOLUME")]
        volume: String,
        #[arg(value_name = "TARGET_REGION")]
        target_region: String,
        /// Target zone (default: zone "a" of the target region)
        #[arg(long, value_name = "ZONE")]
        az: Option<String>,
        /// Delete the intermediate snapshots afterwards
        #[arg(long)]
        cleanup: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = DevboxConfig::load().context("loading devbox config")?;
    if let Some(region) = cli.region {
        settings.region = region;
    }
    let cfg = OrchestratorConfig::default();

    let provider_name = ProviderManager::current_provider_name();
    let provider = ProviderManager::get_provider(&provider_name, &settings.region)
        .with_context(|| format!("initialising provider {}", provider_name))?;
    tracing::info!("☁️ provider={} region={}", provider_name, settings.region);

    // Dropping the operation future stops the current wait; nothing already sent is undone.
    tokio::select! {
        res = run(cli.command, provider.as_ref(), &settings, &cfg) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("🛑 interrupted, in-flight control-plane changes are left as they are");
            anyhow::bail!("interrupted")
        }
    }
}

async fn run(
    command: Command,
    provider: &dyn CloudProvider,
    settings: &DevboxConfig,
    cfg: &OrchestratorConfig,
) -> anyhow::Result<()> {
    match command {
        Command::Resize {
            instance_id,
            profile,
        } => {
            let report = Resizer::new(provider, settings, cfg)
                .resize(&instance_id, &profile)
                .await?;
            print_resize(&report);
        }
        Command::Recover {
            instance_id,
            min_vcpu,
            min_mem,
            max_price,
            yes,
        } => {
            let opts = RecoveryOptions {
                min_vcpus: min_vcpu,
                min_memory_gib: min_mem,
                max_price,
                auto_confirm: yes,
            };
            let report = RecoveryPlanner::new(provider, settings, cfg)
                .recover(&instance_id, &opts)
                .await?;
            let plan = &report.plan;
            println!(
                "Alternatives for {} ({}) in {} (>= {} vCPU, >= {:.0} GiB, {}):\n",
                plan.instance_id,
                plan.current_profile,
                plan.zone,
                plan.constraints.min_vcpus,
                plan.constraints.min_memory_gib,
                plan.constraints.architecture
            );
            if plan.candidates.is_empty() {
                println!("No spot capacity found matching filters.");
                return Ok(());
            }
            print_offers(&plan.candidates);
            match &report.resize {
                Some(resize) => print_resize(resize),
                None => println!(
                    "\nTo resize: devbox-orchestrator resize {} {}",
                    plan.instance_id, plan.candidates[0].profile.name
                ),
            }
        }
        Command::Search {
            profiles,
            min_vcpu,
            min_mem,
            max_price,
            arch,
            gpu,
            az,
            sort,
            limit,
        } => {
            let selector = if profiles.is_empty() {
                ProfileSelector::Constraints(HardwareConstraints {
                    min_vcpus: min_vcpu,
                    min_memory_gib: min_mem,
                    architecture: arch,
                    require_gpu: gpu,
                })
            } else {
                ProfileSelector::Names(profiles)
            };
            let query = CandidateQuery {
                profiles: selector,
                zone: az,
                max_price,
                sort: sort.parse::<SortKey>()?,
                limit: Some(limit),
            };
            let offers = find_candidates(provider, &query, cfg).await?;
            if offers.is_empty() {
                println!("No spot offers match.");
                return Ok(());
            }
            print_offers(&offers);
        }
        Command::VolumeMove {
            volume,
            target_region,
            az,
            cleanup,
        } => {
            let req = VolumeMoveRequest {
                volume,
                target_region,
                target_zone: az,
                cleanup,
            };
            let report = VolumeRelocationOrchestrator::new(provider, cfg)
                .relocate(&req)
                .await?;
            println!("Volume moved successfully!");
            println!("  New volume: {} in {}", report.new_volume_id, report.target_zone);
            for id in &report.deleted_snapshots {
                println!("  Deleted snapshot {}", id);
            }
            for d in &report.degraded {
                println!("  Warning: {}", d);
            }
        }
    }
    Ok(())
}

fn print_offers(offers: &[CandidateOffer]) {
    println!(
        "{:<20} {:>5} {:>9} {:<22} {:<14} {:>10} {:<4}",
        "PROFILE", "VCPU", "MEMORY", "NETWORK", "ZONE", "PRICE", "GPU"
    );
    for o in offers {
        println!(
            "{:<20} {:>5} {:>7.0}Gi {:<22} {:<14} {:>10} {:<4}",
            o.profile.name,
            o.profile.vcpus,
            o.profile.memory_gib(),
            o.profile.network_performance.as_deref().unwrap_or("-"),
            o.zone,
            format!("${:.4}/hr", o.price),
            if o.profile.has_gpu { "yes" } else { "-" }
        );
    }
}

fn print_resize(report: &ResizeReport) {
    println!(
        "Instance {} is now {} ({:?})",
        report.instance_id, report.profile, report.path
    );
    if report.instance_id != report.original_id {
        println!("  replaced {}", report.original_id);
    }
    if let Some(ip) = &report.public_ip {
        println!("  public IP {}", ip);
    }
    for d in &report.degraded {
        println!("  Warning: {}", d);
    }
}
