use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use backend_pool_reconciler::backend_pool::{BackendPoolReconciler, CloudContext};
use backend_pool_reconciler::config::CloudConfig;
use backend_pool_reconciler::network::{FileLoadBalancerClient, LoadBalancer, LoadBalancerClient};
use backend_pool_reconciler::nodes::{
    AddressResolver, NodeInformer, NodeIpCache, NodeSource, StaticNodeSource,
};
use backend_pool_reconciler::vmset::{DetachRequest, StaticVmSet};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::{Node, Service};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile the backend pool of one service
    Reconcile(ReconcileArgs),
    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct ReconcileArgs {
    /// Cloud config JSON file
    #[arg(long, env = "AZURE_CLOUD_CONFIG")]
    cloud_config: PathBuf,

    /// Load balancer snapshot JSON file, updated in place
    #[arg(long)]
    load_balancer: PathBuf,

    /// VM set inventory JSON file
    #[arg(long)]
    vm_set_inventory: PathBuf,

    /// Service manifest (YAML)
    #[arg(long)]
    service: PathBuf,

    /// Node list (YAML sequence of Node objects); watches the cluster when omitted
    #[arg(long)]
    nodes: Option<PathBuf>,

    /// Node names excluded from load balancing
    #[arg(long = "exclude")]
    excluded_nodes: Vec<String>,

    /// Cluster name, also the name of the backend pool
    #[arg(long, env = "CLUSTER_NAME", default_value = "kubernetes")]
    cluster_name: String,

    /// Remove members of non-primary VM sets after reconciling
    #[arg(long)]
    detach_non_primary: bool,

    /// Compute and report changes without persisting them
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    pre_configured: bool,
    changed: bool,
    #[serde(rename = "backendIPv4")]
    backend_ipv4: Vec<String>,
    #[serde(rename = "backendIPv6")]
    backend_ipv6: Vec<String>,
    detaches: Vec<DetachRequest>,
    load_balancer: LoadBalancer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("backend-pool-reconciler v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Reconcile(reconcile_args) => {
            init_tracing(args.log_format);
            run_reconcile(reconcile_args).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

async fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

async fn node_source(
    args: &ReconcileArgs,
    resolver: &AddressResolver,
) -> Result<Arc<dyn NodeSource>> {
    let excluded: HashSet<String> = args.excluded_nodes.iter().cloned().collect();
    if let Some(path) = &args.nodes {
        let nodes: Vec<Node> = read_yaml(path).await?;
        info!("Loaded {} nodes from {}", nodes.len(), path.display());
        return Ok(Arc::new(StaticNodeSource::new(nodes, excluded)));
    }

    let client = kube::Client::try_default()
        .await
        .context("failed to connect to the Kubernetes cluster")?;
    info!("Connected to Kubernetes cluster");
    let informer = NodeInformer::spawn(client, resolver.clone(), excluded);
    informer.wait_until_synced().await?;
    Ok(informer)
}

async fn run_reconcile(args: ReconcileArgs) -> Result<()> {
    info!(
        "Starting backend-pool-reconciler v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = CloudConfig::from_file(&args.cloud_config)
        .await
        .with_context(|| format!("failed to load cloud config {}", args.cloud_config.display()))?;
    let vm_set = Arc::new(
        StaticVmSet::from_file(&args.vm_set_inventory)
            .await
            .context("failed to load VM set inventory")?,
    );
    let lb_client = Arc::new(
        FileLoadBalancerClient::open(&args.load_balancer, args.dry_run)
            .await
            .context("failed to load load balancer snapshot")?,
    );
    let service: Service = read_yaml(&args.service).await?;

    let resolver = AddressResolver::new(Arc::new(NodeIpCache::new()));
    let nodes = node_source(&args, &resolver).await?;
    let resource_group = config.load_balancer_resource_group().to_string();

    let ctx = Arc::new(CloudContext {
        config,
        vm_set: vm_set.clone(),
        lb_client: lb_client.clone(),
        nodes: nodes.clone(),
        addresses: resolver,
    });
    let reconciler = BackendPoolReconciler::new(ctx);
    info!("Backend pool mode: {}", reconciler.mode());

    let mut lb = lb_client.snapshot().await;
    let writes_before = lb_client.writes();
    let outcome = reconciler
        .reconcile(&args.cluster_name, &service, &mut lb)
        .await
        .context("backend pool reconciliation failed")?;

    if lb_client.writes() > writes_before {
        // pick up etags bumped by the write
        let lb_name = lb.name.clone();
        lb = lb_client.get(&resource_group, &lb_name, None).await?;
    }

    if args.detach_non_primary && !outcome.pre_configured {
        reconciler
            .cleanup_non_primary_vm_sets(&mut lb, &service, &nodes.list(), &args.cluster_name)
            .await
            .context("non-primary VM set cleanup failed")?;
    }

    let (backend_ipv4, backend_ipv6) = reconciler
        .backend_private_ips(&args.cluster_name, &service, &lb)
        .await;
    let summary = Summary {
        pre_configured: outcome.pre_configured,
        changed: outcome.changed,
        backend_ipv4,
        backend_ipv6,
        detaches: vm_set.detach_requests().await,
        load_balancer: lb,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if args.dry_run {
        info!(
            "Dry run: {} pool writes computed, none persisted",
            lb_client.writes()
        );
    }
    Ok(())
}
