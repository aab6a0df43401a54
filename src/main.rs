use clap::{Parser, Subcommand};
use knowledge_vaults::config::{CONFIG, StoreBackend, SyncConfig};
use knowledge_vaults::types::{VaultDetailSnapshot, VaultListSnapshot};
use knowledge_vaults::{RemoteStore, RestStore, Session, SqliteStore, VaultDetailHandle, VaultListHandle};
use mimalloc::MiMalloc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "knowledge-vaults", version, about = "Shared research vaults")]
struct Cli {
    /// Act as this profile instead of `session.profile_id` from the config.
    #[arg(long = "as", global = true, env = "KV_PROFILE")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the embedded database and its tables.
    Init,
    /// Print the vaults you belong to.
    List,
    /// Follow one vault and log every change until interrupted.
    Watch { vault_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let cfg = &CONFIG;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        backend = ?cfg.store.backend,
        database_url = %cfg.store.database_url,
        rest_url = %cfg.store.rest_url.as_deref().unwrap_or("<none>"),
        proxy = %cfg.store.proxy.as_deref().unwrap_or("<none>"),
        refetch_debounce_ms = cfg.sync.refetch_debounce_ms
    );

    let session = match cli.profile.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => cfg.session.session_for(id),
        _ => cfg.session.session(),
    };

    match cfg.store.backend {
        StoreBackend::Sqlite => {
            let store = SqliteStore::connect(&cfg.store.database_url).await?;
            let store = match &session {
                Some(s) => store.acting_as(s.profile_id.clone()),
                None => store,
            };
            run(store, session, cli.command).await?;
        }
        StoreBackend::Rest => {
            let store = RestStore::new(&cfg.store)?;
            run(store, session, cli.command).await?;
        }
    }
    Ok(())
}

async fn run<S: RemoteStore>(
    store: S,
    session: Option<Session>,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    let sync: SyncConfig = CONFIG.sync.clone();
    match command {
        Command::Init => {
            if CONFIG.store.backend == StoreBackend::Sqlite {
                info!(database_url = %CONFIG.store.database_url, "schema ready");
            } else {
                warn!("init only applies to the sqlite backend; the REST store manages its own schema");
            }
        }
        Command::List => {
            let view = VaultListHandle::open(store, session, sync).await?;
            let mut rx = view.watch();
            let snapshot = rx.wait_for(|s| !s.loading).await?.clone();
            print_list(&snapshot);
            view.close().await?;
        }
        Command::Watch { vault_id } => {
            let view = VaultDetailHandle::open(store, session, sync, vault_id).await?;
            let mut rx = view.watch();
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = rx.borrow_and_update().clone();
                        log_detail(&snapshot);
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted; closing vault");
                        break;
                    }
                }
            }
            view.close().await?;
        }
    }
    Ok(())
}

fn print_list(snapshot: &VaultListSnapshot) {
    if let Some(err) = &snapshot.last_error {
        warn!(error = %err, "vault list is incomplete");
    }
    if snapshot.vaults.is_empty() {
        println!("No vaults yet.");
        return;
    }
    for summary in &snapshot.vaults {
        println!(
            "{}  {:<32} {:<11} {} sources, {} annotations",
            summary.vault.id,
            summary.vault.name,
            summary.role.as_str(),
            summary.source_count,
            summary.annotation_count,
        );
    }
}

fn log_detail(snapshot: &VaultDetailSnapshot) {
    if snapshot.loading {
        return;
    }
    let Some(vault) = &snapshot.vault else {
        warn!("vault not found or not shared with you");
        return;
    };
    info!(
        vault_id = %vault.id,
        name = %vault.name,
        role = %snapshot.role,
        sources = snapshot.sources.len(),
        annotations = snapshot.annotation_count(),
        members = snapshot.members.len(),
        last_error = snapshot.last_error.as_deref().unwrap_or("-"),
        "vault updated"
    );
}
