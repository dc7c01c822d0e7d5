//! `medbridge`: clinic-to-CRM synchronization service and operator tools.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use medbridge_core::{AppConfig, Result, SyncError, SyncOutcome};
use medbridge_crm::{CrmApi, CrmClient, EntityKind, MockCrm, TokenManager};
use medbridge_db::{MemorySourceStore, PgSourceStore, PgTokenStore, SourceStore};
use medbridge_sync::{PassReport, Scheduler, SyncEngine};

#[derive(Parser)]
#[command(name = "medbridge", version, about = "Clinic to CRM synchronization")]
struct Cli {
    /// Path to a TOML configuration file. Environment variables with the
    /// MEDBRIDGE prefix override file values.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the long-running scheduler service.
    Service,
    /// Run one full patient and reception pass, then exit.
    FullSync,
    /// Run one incremental patient pass.
    IncrementalSync,
    /// Run one reception pass.
    ReceptionSync,
    /// Sync a single patient by id. Dry-runs against an in-memory CRM
    /// unless --live is given.
    TestPatient {
        id: i64,
        #[arg(long)]
        live: bool,
    },
    /// Sync a single reception by id. Dry-runs against an in-memory CRM
    /// unless --live is given.
    TestReception {
        id: i64,
        #[arg(long)]
        live: bool,
    },
    /// Show watermarks and client counters.
    Stats,
    /// Exchange an OAuth authorization code for tokens.
    Auth { code: String },
    /// Check source database connectivity.
    CheckDb,
    /// Check CRM connectivity and credentials.
    CheckCrm,
}

struct App {
    config: AppConfig,
    store: Arc<PgSourceStore>,
    tokens: Arc<TokenManager>,
    crm: Arc<CrmClient>,
    engine: Arc<SyncEngine<PgSourceStore, CrmClient>>,
}

impl App {
    async fn build(config: AppConfig) -> Result<Self> {
        let pool = medbridge_db::connect_pool(&config.database_url).await?;
        let store = Arc::new(PgSourceStore::from_pool(pool.clone()));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Config(format!("building HTTP client: {e}")))?;
        let token_store = Arc::new(PgTokenStore::new(pool));
        let tokens = Arc::new(TokenManager::new(
            http.clone(),
            config.crm.clone(),
            token_store,
        ));
        tokens.load().await?;

        let crm = Arc::new(CrmClient::new(
            http,
            &config.crm,
            &config.rate_limit,
            tokens.clone(),
        ));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            crm.clone(),
            config.fields.clone(),
            config.funnels.clone(),
            config.sync.clone(),
        ));

        Ok(Self {
            config,
            store,
            tokens,
            crm,
            engine,
        })
    }

    /// Engine wired to in-memory stores: same matching and mapping, no
    /// remote or local writes. Used by the test commands' dry-run mode.
    fn dry_run_engine(&self, seed: MemorySourceStore) -> SyncEngine<MemorySourceStore, MockCrm> {
        SyncEngine::new(
            Arc::new(seed),
            Arc::new(MockCrm::new()),
            self.config.fields.clone(),
            self.config.funnels.clone(),
            self.config.sync.clone(),
        )
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let mut builder = config::Config::builder();
    builder = match path {
        Some(path) => builder.add_source(config::File::from(path.as_path())),
        None => builder.add_source(config::File::with_name("medbridge").required(false)),
    };
    let settings = builder
        .add_source(config::Environment::with_prefix("MEDBRIDGE").separator("__"))
        .build()
        .map_err(|e| SyncError::Config(e.to_string()))?;
    let config: AppConfig = settings
        .try_deserialize()
        .map_err(|e| SyncError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

fn print_report(label: &str, report: &PassReport) {
    println!(
        "{label}: {} processed ({} created, {} updated, {} new deals, {} failed)",
        report.total, report.created, report.updated, report.created_deals, report.failed
    );
}

fn print_outcome(outcome: &SyncOutcome) {
    match &outcome.error {
        Some(error) => println!("failed: {error}"),
        None => println!(
            "ok: action={} contact={:?} deal={:?} funnel={:?}",
            outcome
                .action
                .map(|a| a.to_string())
                .unwrap_or_else(|| "none".to_string()),
            outcome.contact_id,
            outcome.deal_id,
            outcome.funnel,
        ),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let app = App::build(config).await?;

    match cli.command {
        Command::Service => {
            info!("starting scheduler service");
            let scheduler = Scheduler::new(app.engine.clone(), app.config.sync.clone());
            tokio::select! {
                result = scheduler.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
            }
        }
        Command::FullSync => {
            let patients = app.engine.sync_patients(None).await?;
            print_report("patients", &patients);
            let receptions = app.engine.sync_receptions().await?;
            print_report("receptions", &receptions);
        }
        Command::IncrementalSync => {
            let report = app.engine.sync_patients_incremental().await?;
            print_report("patients", &report);
        }
        Command::ReceptionSync => {
            let report = app.engine.sync_receptions().await?;
            print_report("receptions", &report);
        }
        Command::TestPatient { id, live } => {
            if live {
                print_outcome(&app.engine.sync_patient(id).await?);
            } else {
                let patient = app.store.patient(id).await?.ok_or(SyncError::NotFoundLocal {
                    kind: "patient",
                    id,
                })?;
                let seed = MemorySourceStore::new();
                seed.push_patient(patient);
                print_outcome(&app.dry_run_engine(seed).sync_patient(id).await?);
                println!("(dry run, nothing written to the CRM)");
            }
        }
        Command::TestReception { id, live } => {
            if live {
                print_outcome(&app.engine.sync_reception(id).await?);
            } else {
                let reception =
                    app.store
                        .reception(id)
                        .await?
                        .ok_or(SyncError::NotFoundLocal {
                            kind: "reception",
                            id,
                        })?;
                let seed = MemorySourceStore::new();
                if let Some(patient) = app.store.patient(reception.patient_id).await? {
                    seed.push_patient(patient);
                }
                seed.push_reception(reception);
                print_outcome(&app.dry_run_engine(seed).sync_reception(id).await?);
                println!("(dry run, nothing written to the CRM)");
            }
        }
        Command::Stats => {
            let stats = app.engine.statistics().await?;
            println!("patients tracked:     {}", stats.patients_tracked);
            println!("patients watermark:   {:?}", stats.patients_watermark);
            println!("receptions watermark: {:?}", stats.receptions_watermark);
            println!(
                "client: {} requests, {} auth retries",
                stats.client.requests, stats.client.auth_retries
            );
        }
        Command::Auth { code } => {
            app.tokens.exchange_code(&code).await?;
            println!("token pair stored");
        }
        Command::CheckDb => {
            app.store.ping().await?;
            println!("source database reachable");
        }
        Command::CheckCrm => {
            let fields = app.crm.list_custom_fields(EntityKind::Contacts).await?;
            println!("CRM reachable, {} contact custom fields", fields.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}
