use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kolibri_core::{EventRecorder, NamespaceScope};
use kolibri_kubehub::{KubeEventRecorder, KubeSource};
use kolibri_runtime::{Context, Coordinator, HandlerBuilder, HandlerOptions, LogRecorder};
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod policy;

use policy::LabelChanged;

#[derive(Parser, Debug)]
#[command(name = "service-watcher", version, about = "Kolibri sample: log Service and ConfigMap changes")]
struct Cli {
    /// Namespace to watch (default: current context)
    #[arg(long = "ns", conflicts_with = "all_namespaces")]
    namespace: Option<String>,

    /// Watch every namespace
    #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
    all_namespaces: bool,

    /// Workers per handler (overrides KOLIBRI_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Retries before a failing item is dropped (overrides KOLIBRI_MAX_RETRIES)
    #[arg(long = "max-retries")]
    max_retries: Option<u32>,

    /// Service updates are only reconciled when this label changes
    #[arg(long, default_value = "app")]
    label: String,

    /// Publish Kubernetes events instead of logging them
    #[arg(long = "events", action = ArgAction::SetTrue)]
    events: bool,
}

fn init_tracing() {
    let env = std::env::var("KOLIBRI_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KOLIBRI_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KOLIBRI_METRICS_ADDR; expected host:port");
        }
    }
}

fn describe_service(ctx: &Context<Service>) -> String {
    let spec = ctx.last_seen().and_then(|s| s.spec.as_ref());
    let type_ = spec.and_then(|s| s.type_.as_deref()).unwrap_or("ClusterIP");
    let ip = spec.and_then(|s| s.cluster_ip.as_deref()).unwrap_or("-");
    format!("{} {}", type_, ip)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut options = HandlerOptions::from_env();
    if let Some(w) = cli.workers {
        options.workers = w;
    }
    if let Some(r) = cli.max_retries {
        options.max_retries = r;
    }
    let scope = match (cli.all_namespaces, cli.namespace) {
        (true, _) => NamespaceScope::All,
        (false, Some(ns)) => NamespaceScope::Namespace(ns),
        (false, None) => NamespaceScope::Current,
    };

    let client = Client::try_default().await?;
    let recorder: Arc<dyn EventRecorder> = if cli.events {
        Arc::new(KubeEventRecorder::spawn(client.clone(), "service-watcher", 256))
    } else {
        Arc::new(LogRecorder)
    };
    info!(scope = ?scope, workers = options.workers, label = %cli.label, "service-watcher starting");

    let services = HandlerBuilder::<Service>::new()
        .name("services")
        .controller("service-watcher")
        .namespace_scope(scope.clone())
        .options(options.clone())
        .update_policy(LabelChanged { label: cli.label.clone() })
        .recorder(Arc::clone(&recorder))
        .on_create(|ctx| async move {
            info!(ns = ctx.namespace(), name = ctx.name(), svc = %describe_service(&ctx), "service added");
            Ok(())
        })
        .on_change(|ctx| async move {
            info!(ns = ctx.namespace(), name = ctx.name(), svc = %describe_service(&ctx), "service relabelled");
            Ok(())
        })
        .on_delete(|ctx| async move {
            info!(ns = ctx.namespace(), name = ctx.name(), "service removed");
            Ok(())
        })
        .build(KubeSource::<Service>::namespaced(client.clone()))?;

    let configmaps = HandlerBuilder::<ConfigMap>::new()
        .name("configmaps")
        .controller("service-watcher")
        .namespace_scope(scope)
        .options(options)
        .on_change(|ctx| async move {
            let keys = ctx.last_seen().and_then(|cm| cm.data.as_ref()).map(|d| d.len()).unwrap_or(0);
            info!(ns = ctx.namespace(), name = ctx.name(), keys, "configmap changed");
            Ok(())
        })
        .build(KubeSource::<ConfigMap>::namespaced(client))?;

    let mut coordinator = Coordinator::new("service-watcher");
    coordinator.register(services)?.register(configmaps)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("interrupt received, shutting down"),
                Err(e) => {
                    warn!(error = %e, "cannot listen for interrupt");
                    return;
                }
            }
            cancel.cancel();
        }
    });
    coordinator.run(cancel).await?;
    info!("service-watcher stopped");
    Ok(())
}
