use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client, CustomResourceExt};
use metrics::gauge;
use mirror_core::{ConfigMirror, ObjectKey};
use mirror_engine::{Context, EngineConfig, GenerationFilter, MirrorIndex, Reconciler};
use mirror_kubehub::{start_watcher, Change, KubeStore, ObjectStore};
use mirror_persist::{Owner, RecordStore, SqliteStore};
use mirror_queue::DispatchConfig;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mirrorctl", version, about = "ConfigMirror controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database for ConfigMap snapshots
    #[arg(long = "db-path", env = "MIRROR_DB_PATH", global = true)]
    db_path: Option<String>,

    /// Prometheus listener, e.g. 0.0.0.0:9090
    #[arg(long = "metrics-addr", env = "MIRROR_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until Ctrl-C
    Run(RunArgs),
    /// Print the ConfigMirror CustomResourceDefinition
    Crd,
    /// List persisted snapshots for one ConfigMirror, newest first
    Records {
        #[arg(long = "owner")]
        owner: String,
        #[arg(long = "owner-namespace")]
        owner_namespace: String,
    },
    /// Open the database, create the schema and check liveness
    PingDb,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long = "workers", env = "MIRROR_WORKERS", default_value_t = 4)]
    workers: usize,
    /// Periodic resync after a successful pass
    #[arg(long = "resync-secs", env = "MIRROR_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,
    #[arg(long = "pass-timeout-secs", env = "MIRROR_PASS_TIMEOUT_SECS", default_value_t = 60)]
    pass_timeout_secs: u64,
    #[arg(long = "queue-cap", env = "MIRROR_QUEUE_CAP", default_value_t = 1024)]
    queue_cap: usize,
    /// Only watch this namespace (default: all namespaces)
    #[arg(long = "watch-namespace")]
    watch_namespace: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("MIRROR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid MIRROR_METRICS_ADDR; expected host:port");
    }
}

fn open_records(db_path: Option<&str>) -> Result<SqliteStore> {
    let store = match db_path {
        Some(p) => SqliteStore::open(p).with_context(|| format!("opening database {}", p))?,
        None => SqliteStore::open_default().context("opening default database")?,
    };
    store.init_schema().context("creating schema")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    match cli.command {
        Commands::Run(args) => run(args, cli.db_path.as_deref()).await?,
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&ConfigMirror::crd())?);
        }
        Commands::Records { owner, owner_namespace } => {
            let store = open_records(cli.db_path.as_deref())?;
            let rows = store.query(&Owner::new(owner, owner_namespace))?;
            match cli.output {
                Output::Human => {
                    println!("NAMESPACE        NAME                     KEYS  UPDATED");
                    for r in &rows {
                        println!(
                            "{:<16} {:<24} {:<5} {}",
                            r.snapshot.namespace,
                            r.snapshot.name,
                            r.snapshot.data.len(),
                            r.updated_at.to_rfc3339()
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::PingDb => {
            let store = open_records(cli.db_path.as_deref())?;
            store.ping()?;
            println!("database ok");
        }
    }
    Ok(())
}

async fn run(args: RunArgs, db_path: Option<&str>) -> Result<()> {
    let client = mirror_kubehub::watch::client().await?;
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone(), args.watch_namespace.clone()));

    let records = match db_path {
        Some(p) => {
            let rs: Arc<dyn RecordStore> = Arc::new(open_records(Some(p))?);
            info!(path = %p, "persistence enabled");
            Some(rs)
        }
        None => {
            info!("no database configured; persistence disabled");
            None
        }
    };

    let engine = EngineConfig { resync: Duration::from_secs(args.resync_secs), ..EngineConfig::default() };
    let ctx = Arc::new(Context::new(store.clone(), records, engine));
    let pass_timeout = Duration::from_secs(args.pass_timeout_secs);
    let dispatch = DispatchConfig { workers: args.workers, pass_timeout, channel_cap: args.queue_cap };
    let (keys_tx, dispatcher) = mirror_queue::spawn(dispatch, Arc::new(Reconciler::new(ctx)));

    let (mirrors_tx, mirrors_rx) = mpsc::channel::<Change<ConfigMirror>>(args.queue_cap.max(1));
    let (cms_tx, cms_rx) = mpsc::channel::<Change<ConfigMap>>(args.queue_cap.max(1));
    let ns = args.watch_namespace.as_deref();
    let mirror_watch = tokio::spawn({
        let api = scoped_api::<ConfigMirror>(&client, ns);
        async move {
            if let Err(e) = start_watcher(api, "ConfigMirror", mirrors_tx).await {
                error!(error = ?e, "ConfigMirror watcher failed");
            }
        }
    });
    let cm_watch = tokio::spawn({
        let api = scoped_api::<ConfigMap>(&client, ns);
        async move {
            if let Err(e) = start_watcher(api, "ConfigMap", cms_tx).await {
                error!(error = ?e, "ConfigMap watcher failed");
            }
        }
    });
    let mut router = tokio::spawn(route_changes(mirrors_rx, cms_rx, keys_tx));
    info!(workers = args.workers, namespace = ?ns, "controller running");

    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown requested"),
        _ = &mut router => warn!("change routing stopped"),
    }
    mirror_watch.abort();
    cm_watch.abort();
    router.abort();
    // the router owns the last request sender; once it is gone the dispatcher drains
    let _ = router.await;
    if tokio::time::timeout(pass_timeout + Duration::from_secs(5), dispatcher).await.is_err() {
        warn!("dispatcher did not drain in time");
    }
    info!("controller stopped");
    Ok(())
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Translate watch changes into dispatcher keys. ConfigMap events are routed against
/// the mirrors seen on the ConfigMirror watch.
async fn route_changes(
    mut mirrors: mpsc::Receiver<Change<ConfigMirror>>,
    mut config_maps: mpsc::Receiver<Change<ConfigMap>>,
    keys: mpsc::Sender<ObjectKey>,
) {
    let mut filter = GenerationFilter::new();
    let mut index = MirrorIndex::new();
    loop {
        let batch: Vec<ObjectKey> = tokio::select! {
            Some(change) = mirrors.recv() => {
                index.apply(change.kind, &change.object);
                gauge!("mirror_routing_index_size", index.len() as f64);
                filter.observe(change.kind, &change.object).into_iter().collect()
            }
            Some(change) = config_maps.recv() => index.route(&change.object),
            else => break,
        };
        for key in batch {
            if keys.send(key).await.is_err() {
                return;
            }
        }
    }
    warn!("watch channels closed");
}
