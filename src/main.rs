use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use referral_desk::config::{self, Config};
use referral_desk::db::{self, Pool};
use referral_desk::events::WebhookSink;
use referral_desk::jobs::{
    BatchJob, GeneratePayouts, MessageCode, MigrateReferralFields, ProgressStore,
    RecountAffiliateStats, Runner, SqliteProgressStore,
};
use referral_desk::lifecycle::ReferralManager;

#[derive(Debug, Parser)]
#[command(author, version, about = "Referral lifecycle and batch job runner")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive a job to completion, one step at a time. Resumes saved progress.
    Run {
        job: JobName,
        /// Job parameters as a JSON object; only used when the job starts fresh
        #[arg(long)]
        params: Option<String>,
        /// Items per step for a fresh job (defaults to jobs.per_step)
        #[arg(long)]
        per_step: Option<u32>,
    },
    /// Forget a job's saved progress
    Reset { job: JobName },
    /// Print a job's saved progress
    Status { job: JobName },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum JobName {
    Recount,
    Migrate,
    Payouts,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let store: Arc<dyn ProgressStore> = Arc::new(SqliteProgressStore::new(pool.clone()));
    let manager = Arc::new(build_manager(&cfg, pool.clone())?);

    match args.command {
        Command::Run {
            job,
            params,
            per_step,
        } => {
            let params = match params {
                Some(raw) => serde_json::from_str(&raw).context("--params must be valid JSON")?,
                None => Value::Null,
            };
            let per_step = per_step.unwrap_or(cfg.jobs.per_step);
            match job {
                JobName::Recount => {
                    let job = RecountAffiliateStats::new(pool);
                    run(&cfg, store, job, params, per_step).await
                }
                JobName::Migrate => {
                    let job = MigrateReferralFields::new(pool, &cfg.referrals.default_currency);
                    run(&cfg, store, job, params, per_step).await
                }
                JobName::Payouts => {
                    let job = GeneratePayouts::new(manager);
                    run(&cfg, store, job, params, per_step).await
                }
            }
        }
        Command::Reset { job } => {
            let job_id = job_id(job);
            let mut runner = Runner::new(IdOnly(job_id), store);
            runner.reset().await?;
            println!("{} progress cleared", job_id);
            Ok(())
        }
        Command::Status { job } => {
            let job_id = job_id(job);
            let runner = Runner::new(IdOnly(job_id), store);
            let status = match runner.progress().await? {
                Some(p) => json!({
                    "job": job_id,
                    "running": true,
                    "step": p.step,
                    "per_step": p.per_step,
                    "current_count": p.current_count,
                    "total_count": p.total_count,
                    "params": p.params,
                }),
                None => json!({ "job": job_id, "running": false }),
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

fn build_manager(cfg: &Config, pool: Pool) -> Result<ReferralManager> {
    let registry = cfg.integration_registry();
    let contexts: Vec<_> = registry.contexts().map(str::to_string).collect();
    info!(?contexts, "integrations registered");
    let mut manager = ReferralManager::new(pool, cfg.policy()).with_integrations(registry);
    if let Some(url) = &cfg.events.webhook_url {
        let sink = WebhookSink::new(url, cfg.events.webhook_token.clone())?;
        manager = manager.with_events(Arc::new(sink));
    }
    Ok(manager)
}

async fn run<J: BatchJob>(
    cfg: &Config,
    store: Arc<dyn ProgressStore>,
    job: J,
    params: Value,
    per_step: u32,
) -> Result<()> {
    let mut runner = Runner::new(job, store)
        .with_params(params)
        .with_per_step(per_step)
        .with_lease_ttl(Duration::from_secs(cfg.jobs.lease_seconds));

    match runner.run_to_completion().await {
        Ok(0) => {
            println!("{}", runner.get_message(MessageCode::NothingToDo));
            Ok(())
        }
        Ok(processed) => {
            info!(job_id = runner.job().id(), processed, "job done");
            println!("{}", runner.get_message(MessageCode::Done));
            Ok(())
        }
        Err(err) => {
            warn!(?err, job_id = runner.job().id(), "job stopped");
            println!("{}", runner.get_message(MessageCode::Failed));
            Err(err)
        }
    }
}

fn job_id(job: JobName) -> &'static str {
    match job {
        JobName::Recount => RecountAffiliateStats::ID,
        JobName::Migrate => MigrateReferralFields::ID,
        JobName::Payouts => GeneratePayouts::ID,
    }
}

/// Stands in for a job when only its persisted progress is touched.
struct IdOnly(&'static str);

#[async_trait::async_trait]
impl BatchJob for IdOnly {
    fn id(&self) -> &str {
        self.0
    }

    async fn process_step(
        &mut self,
        _ctx: &referral_desk::jobs::JobContext<'_>,
    ) -> Result<referral_desk::jobs::StepReport> {
        anyhow::bail!("{} cannot be run from here", self.0)
    }
}
