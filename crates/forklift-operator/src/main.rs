//! Forklift operator - migrates virtual machines into KubeVirt

mod controller_runner;

use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, ResourceExt};

use forklift_common::crd::{Hook, Migration, NetworkMap, Plan, Provider, StorageMap};
use forklift_common::settings::{OsEnv, Settings};
use forklift_common::telemetry::{init_telemetry, TelemetryConfig};
use forklift_common::FIELD_MANAGER;
use forklift_inventory::{Inventory, InventoryClient, InventoryConfig};

/// Forklift - CRD-driven operator migrating VMs from vSphere, oVirt and OpenStack
#[derive(Parser, Debug)]
#[command(name = "forklift-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Providers, Plans and Migrations and reconciles them.
    Controller,
}

/// Every CRD the operator owns, in install order
fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        Provider::crd(),
        NetworkMap::crd(),
        StorageMap::crd(),
        Hook::crd(),
        Plan::crd(),
        Migration::crd(),
    ]
}

fn crd_manifests() -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for crd in crds() {
        docs.push(serde_yaml::to_string(&crd).context("serializing CRD")?);
    }
    Ok(docs.join("---\n"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "forklift-controller".to_string(),
        ..Default::default()
    })
    .context("initializing telemetry")?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller().await,
    }
}

/// Ensure all forklift CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "installing CRD");
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .with_context(|| format!("installing CRD {name}"))?;
    }

    tracing::info!("All forklift CRDs installed/updated");
    Ok(())
}

async fn run_controller() -> anyhow::Result<()> {
    tracing::info!("Forklift controller starting...");

    // Configuration errors stop startup before anything is watched
    let settings = Arc::new(Settings::load(&OsEnv).context("loading settings")?);
    let inventory_config = InventoryConfig::from_env(&OsEnv).context("loading inventory settings")?;
    let inventory: Arc<dyn Inventory> =
        Arc::new(InventoryClient::new(&inventory_config).context("building inventory client")?);
    tracing::info!(
        max_vm_inflight = settings.max_vm_inflight,
        inventory = %format!("{}:{}", inventory_config.host, inventory_config.port),
        "configuration loaded"
    );

    let client = Client::try_default()
        .await
        .context("creating Kubernetes client")?;

    ensure_crds_installed(&client).await?;

    tracing::info!("Starting controllers:");
    let mut controllers =
        controller_runner::build_provider_controllers(client.clone(), inventory.clone());
    controllers.extend(controller_runner::build_plan_controllers(
        client, inventory, settings,
    ));

    // Every controller stops on the same shutdown signal
    futures::future::join_all(controllers).await;

    tracing::info!("Forklift controller shutting down");
    Ok(())
}
