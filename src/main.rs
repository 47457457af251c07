//! Kronos Operator - scheduled sleep and wake for Kubernetes workloads

use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kronos::controller::{error_policy, reconcile, Context, FIELD_MANAGER};
use kronos::crd::KronosApp;

/// Kronos - puts Kubernetes workloads to sleep on a schedule
#[derive(Parser, Debug)]
#[command(name = "kronos", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(
        long,
        env = "KRONOS_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        global = true
    )]
    log_format: LogFormat,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches KronosApps in every namespace and sleeps or wakes their
    /// workloads as their schedules dictate.
    Controller,
}

/// Controller settings
#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// Upper bound on a single reconcile, in seconds
    #[arg(
        long,
        env = "KRONOS_RECONCILE_TIMEOUT_SECS",
        default_value = "60",
        global = true
    )]
    reconcile_timeout_secs: u64,

    /// Install or update the KronosApp CRD on startup
    #[arg(
        long,
        env = "KRONOS_INSTALL_CRD",
        default_value_t = true,
        action = ArgAction::Set,
        global = true
    )]
    install_crd: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&KronosApp::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.log_format)?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kronos=debug,kube=info,tower=warn,hyper=warn"));

    let (json_layer, text_layer) = match format {
        LogFormat::Json => (
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            ),
            None,
        ),
        LogFormat::Text => (None, Some(fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Install or update the KronosApp CRD using server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing KronosApp CRD...");
    crds.patch(
        "kronosapps.core.wecraft.tn",
        &params,
        &Patch::Apply(&KronosApp::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install KronosApp CRD: {}", e))?;

    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let ctx = Arc::new(
        Context::builder(client.clone())
            .reconcile_timeout(Duration::from_secs(args.reconcile_timeout_secs))
            .build(),
    );
    let apps: Api<KronosApp> = Api::all(client);

    tracing::info!(
        reconcile_timeout_secs = args.reconcile_timeout_secs,
        "Starting KronosApp controller..."
    );

    Controller::new(apps, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "KronosApp reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "KronosApp reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("KronosApp controller stopped");
    Ok(())
}
