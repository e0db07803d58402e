//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tracing::info;
use wikiselect_core::{
    AppContext, BuilderDraft, FireOutcome, JobOutcome, NewSchedule, RemoteStatus, WaitProgress,
    Worker,
};
use wikiselect_shared::{AppConfig, ArchiveTask, init_config, load_config, load_config_from};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// WikiSelect: curated wiki article selections and archive builds.
#[derive(Parser)]
#[command(
    name = "wikiselect",
    version,
    about = "Build versioned wiki article selections and export them as archives.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.wikiselect/wikiselect.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Acting user for commands that change owned resources.
    #[arg(long = "as", global = true, env = "WIKISELECT_USER")]
    pub actor: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Manage builders.
    Builder {
        #[command(subcommand)]
        action: BuilderAction,
    },

    /// Inspect and prune selections.
    Selection {
        #[command(subcommand)]
        action: SelectionAction,
    },

    /// Manage recurrence schedules.
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Archive exports and build service status.
    Archive {
        #[command(subcommand)]
        action: ArchiveAction,
    },

    /// Process jobs from the broker until interrupted.
    Worker {
        /// Queues to serve, in priority order. Defaults to all.
        #[arg(long = "queue")]
        queues: Vec<String>,

        /// Process at most one job and exit.
        #[arg(long)]
        once: bool,
    },

    /// Broker job maintenance.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Builder definition flags shared by `create`, `update` and `check`.
#[derive(clap::Args)]
pub(crate) struct DraftArgs {
    /// Builder name; also the artifact file name.
    #[arg(long)]
    name: String,

    /// Wiki project, e.g. en.wikipedia.org.
    #[arg(long)]
    project: String,

    /// Model tag: simple, sparql or petscan.
    #[arg(long, default_value = "simple")]
    model: String,

    /// Model parameters as inline JSON.
    #[arg(long, conflicts_with_all = ["params_file", "list_file"])]
    params: Option<String>,

    /// Model parameters from a JSON file.
    #[arg(long, conflicts_with = "list_file")]
    params_file: Option<PathBuf>,

    /// Newline-separated article list for the simple model.
    #[arg(long)]
    list_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub(crate) enum BuilderAction {
    /// Validate a definition without saving it.
    Check(DraftArgs),
    /// Create a builder.
    Create(DraftArgs),
    /// Replace a builder's definition.
    Update {
        id: String,
        #[command(flatten)]
        draft: DraftArgs,
    },
    /// Delete a builder with its selections and schedules.
    Delete { id: String },
    /// List builders.
    List {
        /// Only builders owned by this user.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show one builder as JSON.
    Show { id: String },
    /// Enqueue a materialization (and export in production).
    Run { id: String },
}

#[derive(Subcommand)]
pub(crate) enum SelectionAction {
    /// List a builder's selections, newest first.
    List { builder_id: String },
    /// Print the public download URL of a selection.
    Url { id: String },
    /// Delete all but the newest versions.
    Prune {
        builder_id: String,
        #[arg(long, default_value = "1")]
        keep: u32,
    },
}

#[derive(Subcommand)]
pub(crate) enum ScheduleAction {
    /// Create a schedule; its first run is enqueued immediately.
    Create {
        builder_id: String,
        /// Days between runs. Omit for a one-shot schedule.
        #[arg(long)]
        every_days: Option<i64>,
        /// Number of runs. Omit for unlimited.
        #[arg(long)]
        generations: Option<i64>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        long_description: Option<String>,
        /// Address to notify when an archive is ready.
        #[arg(long)]
        email: Option<String>,
    },
    /// List a builder's schedules.
    List { builder_id: String },
    /// Stop a schedule.
    Cancel { id: String },
    /// Fire a schedule now, outside its timer.
    Fire { id: String },
    /// Confirm a notification address.
    Confirm { token: String },
    /// Remove a notification address, by token or by schedule id.
    Unsubscribe {
        #[arg(long, conflicts_with = "id", required_unless_present = "id")]
        token: Option<String>,
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Subcommand)]
pub(crate) enum ArchiveAction {
    /// Request an archive build for a selection.
    Request {
        selection_id: String,
        #[arg(long)]
        schedule: Option<String>,
    },
    /// Apply a status reported by the build service.
    Status {
        external_task_id: String,
        /// Reported status, e.g. completed or failed.
        status: String,
        #[arg(long)]
        error: Option<String>,
    },
    /// Query the build service for every requested task.
    Poll,
    /// Show a task as JSON.
    Show { task_id: String },
    /// Poll one task until it finishes.
    Wait {
        task_id: String,
        #[arg(long, default_value = "10")]
        interval_secs: u64,
        #[arg(long, default_value = "3600")]
        timeout_secs: u64,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List broker jobs.
    List {
        /// Only jobs on this queue.
        #[arg(long)]
        queue: Option<String>,
    },
    /// Delete finished, failed and cancelled jobs that ended a while ago.
    Prune {
        /// Keep jobs that ended within this many days.
        #[arg(long, default_value = "30")]
        older_than_days: u32,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "wikiselect=info",
        1 => "wikiselect=debug",
        _ => "wikiselect=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    let actor = cli.actor.as_deref();

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
        Command::Builder { action } => {
            let ctx = open_context(config_path).await?;
            cmd_builder(&ctx, actor, action).await
        }
        Command::Selection { action } => {
            let ctx = open_context(config_path).await?;
            cmd_selection(&ctx, actor, action).await
        }
        Command::Schedule { action } => {
            let ctx = open_context(config_path).await?;
            cmd_schedule(&ctx, actor, action).await
        }
        Command::Archive { action } => {
            let ctx = open_context(config_path).await?;
            cmd_archive(&ctx, action).await
        }
        Command::Worker { queues, once } => {
            let ctx = open_context(config_path).await?;
            cmd_worker(&ctx, queues, once).await
        }
        Command::Jobs { action } => {
            let ctx = open_context(config_path).await?;
            cmd_jobs(&ctx, action).await
        }
    }
}

async fn cmd_jobs(ctx: &AppContext, action: JobsAction) -> Result<()> {
    match action {
        JobsAction::List { queue } => {
            for job in ctx.storage.list_jobs(queue.as_deref()).await? {
                println!(
                    "{}  {:<11} {:<10} {}",
                    job.id, job.queue, job.status, job.payload
                );
            }
        }
        JobsAction::Prune { older_than_days } => {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(older_than_days));
            let pruned = ctx.storage.prune_jobs(cutoff).await?;
            println!("Pruned {pruned} job(s) that ended before {}", cutoff.to_rfc3339());
        }
    }
    Ok(())
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

async fn open_context(path: Option<&Path>) -> Result<AppContext> {
    let config = resolve_config(path)?;
    Ok(AppContext::open(config).await?)
}

fn require_actor(actor: Option<&str>) -> Result<&str> {
    actor.ok_or_else(|| eyre!("this command needs an acting user: pass --as <user> or set WIKISELECT_USER"))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| eyre!("cannot read '{}': {e}", path.display()))
}

impl DraftArgs {
    fn into_draft(self) -> Result<BuilderDraft> {
        let params = match (self.params, self.params_file, self.list_file) {
            (Some(inline), _, _) => serde_json::from_str(&inline)
                .map_err(|e| eyre!("--params is not valid JSON: {e}"))?,
            (None, Some(path), _) => serde_json::from_str(&read_file(&path)?)
                .map_err(|e| eyre!("'{}' is not valid JSON: {e}", path.display()))?,
            (None, None, Some(path)) => serde_json::json!({ "list": read_file(&path)? }),
            (None, None, None) => Value::Object(Default::default()),
        };
        Ok(BuilderDraft {
            name: self.name,
            project: self.project,
            model: self.model,
            params,
        })
    }
}

async fn cmd_builder(ctx: &AppContext, actor: Option<&str>, action: BuilderAction) -> Result<()> {
    let builders = ctx.builders();
    match action {
        BuilderAction::Check(args) => {
            let validation = builders.check(&args.into_draft()?)?;
            print_json(&validation)?;
            if !validation.is_valid() {
                return Err(eyre!("{} problem(s) found", validation.errors.len()));
            }
        }
        BuilderAction::Create(args) => {
            let builder = builders.create(require_actor(actor)?, args.into_draft()?).await?;
            println!("Builder created: {}", builder.id);
        }
        BuilderAction::Update { id, draft } => {
            let builder = builders
                .update(require_actor(actor)?, &id, draft.into_draft()?)
                .await?;
            println!("Builder updated: {} ({})", builder.id, builder.name);
        }
        BuilderAction::Delete { id } => {
            builders.delete(require_actor(actor)?, &id).await?;
            println!("Builder deleted: {id}");
        }
        BuilderAction::List { owner } => {
            for builder in builders.list(owner.as_deref()).await? {
                println!(
                    "{}  v{:<4} {:<8} {:<20} {}",
                    builder.id, builder.current_version, builder.model, builder.project, builder.name
                );
            }
        }
        BuilderAction::Show { id } => print_json(&builders.get(&id).await?)?,
        BuilderAction::Run { id } => {
            builders.get(&id).await?;
            let run = ctx.orchestrator().enqueue_builder_run(&id, None).await?;
            println!("Materialize job: {}", run.materialize_job_id);
            match run.export_job_id {
                Some(job) => println!("Export job:      {job}"),
                None => println!("Export job:      skipped (not production)"),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Selections
// ---------------------------------------------------------------------------

async fn cmd_selection(ctx: &AppContext, actor: Option<&str>, action: SelectionAction) -> Result<()> {
    let selections = ctx.selections();
    match action {
        SelectionAction::List { builder_id } => {
            for selection in selections.list(&builder_id).await? {
                println!(
                    "{}  v{:<4} {:<6} {:>7} articles  {}",
                    selection.id,
                    selection.version,
                    selection.status,
                    selection.article_count,
                    selection.storage_key
                );
                for message in &selection.error_messages {
                    println!("    error: {message}");
                }
            }
        }
        SelectionAction::Url { id } => println!("{}", selections.public_url(&id).await?),
        SelectionAction::Prune { builder_id, keep } => {
            let pruned = selections
                .prune(require_actor(actor)?, &builder_id, keep)
                .await?;
            println!("Pruned {} selection(s)", pruned.len());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

async fn cmd_schedule(ctx: &AppContext, actor: Option<&str>, action: ScheduleAction) -> Result<()> {
    let scheduler = ctx.scheduler();
    match action {
        ScheduleAction::Create {
            builder_id,
            every_days,
            generations,
            title,
            description,
            long_description,
            email,
        } => {
            let params = NewSchedule {
                interval_secs: every_days.map(|d| d.saturating_mul(86_400)),
                remaining_generations: generations,
                title,
                description,
                long_description,
                email,
            };
            let schedule = scheduler
                .create_schedule(require_actor(actor)?, &builder_id, params)
                .await?;
            println!("Schedule created: {}", schedule.id);
            if schedule.email.is_some() {
                println!("A confirmation mail was sent to the notification address.");
            }
        }
        ScheduleAction::List { builder_id } => {
            for schedule in scheduler.list(&builder_id).await? {
                let every = schedule
                    .interval_secs
                    .map(|s| format!("every {}d", s / 86_400))
                    .unwrap_or_else(|| "once".into());
                let left = schedule
                    .remaining_generations
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "unlimited".into());
                println!(
                    "{}  {:<9} {:<10} {left} left  {}",
                    schedule.id, schedule.status, every, schedule.title
                );
                if let Some(error) = &schedule.last_error {
                    println!("    last firing failed: {error}");
                }
            }
        }
        ScheduleAction::Cancel { id } => {
            scheduler.cancel(require_actor(actor)?, &id).await?;
            println!("Schedule cancelled: {id}");
        }
        ScheduleAction::Fire { id } => match scheduler.fire(&id).await? {
            FireOutcome::Ignored => println!("Schedule {id} is not active"),
            FireOutcome::Rearmed {
                run, next_job_id, ..
            } => println!(
                "Run enqueued ({}); next timer {next_job_id}",
                run.materialize_job_id
            ),
            FireOutcome::Exhausted { run } => println!(
                "Run enqueued ({}); schedule exhausted",
                run.materialize_job_id
            ),
        },
        ScheduleAction::Confirm { token } => {
            let schedule = scheduler.confirm_email(&token).await?;
            println!("Notifications confirmed for \"{}\"", schedule.title);
        }
        ScheduleAction::Unsubscribe { token, id } => {
            let schedule = match (token, id) {
                (Some(token), _) => scheduler.unsubscribe_by_token(&token).await?,
                (None, Some(id)) => scheduler.unsubscribe(require_actor(actor)?, &id).await?,
                (None, None) => return Err(eyre!("pass --token or --id")),
            };
            println!("Unsubscribed from \"{}\"", schedule.title);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Archives
// ---------------------------------------------------------------------------

async fn cmd_archive(ctx: &AppContext, action: ArchiveAction) -> Result<()> {
    let tracker = ctx.archive_tracker();
    match action {
        ArchiveAction::Request {
            selection_id,
            schedule,
        } => {
            let task = tracker
                .request_export(&selection_id, schedule.as_deref())
                .await?;
            println!(
                "Archive task {} {} (build service id {})",
                task.id,
                task.status,
                task.external_task_id.as_deref().unwrap_or("-")
            );
        }
        ArchiveAction::Status {
            external_task_id,
            status,
            error,
        } => {
            let remote = match status.parse::<RemoteStatus>().map_err(|e| eyre!(e))? {
                RemoteStatus::Failed(_) => RemoteStatus::Failed(error),
                other => other,
            };
            match tracker.apply_status(&external_task_id, remote).await? {
                Some(task) => println!("Archive task {} is now {}", task.id, task.status),
                None => println!("No change"),
            }
        }
        ArchiveAction::Poll => {
            let summary = tracker.poll_requested().await?;
            println!(
                "Checked {}: {} completed, {} failed, {} errors",
                summary.checked, summary.completed, summary.failed, summary.errors
            );
        }
        ArchiveAction::Show { task_id } => print_json(&tracker.get(&task_id).await?)?,
        ArchiveAction::Wait {
            task_id,
            interval_secs,
            timeout_secs,
        } => {
            let progress = CliProgress::new();
            let result = tracker
                .wait_for(
                    &task_id,
                    Duration::from_secs(interval_secs),
                    Duration::from_secs(timeout_secs),
                    &progress,
                )
                .await;
            progress.spinner.finish_and_clear();
            let task = result?;
            println!("Archive task {} {}", task.id, task.status);
            if let Some(message) = &task.error_message {
                println!("  {message}");
            }
        }
    }
    Ok(())
}

/// Spinner for `archive wait`.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl WaitProgress for CliProgress {
    fn update(&self, task: &ArchiveTask, elapsed: Duration) {
        self.spinner.set_message(format!(
            "{} [{}] {}s",
            task.id,
            task.status,
            elapsed.as_secs()
        ));
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn cmd_worker(ctx: &AppContext, queues: Vec<String>, once: bool) -> Result<()> {
    let worker = if queues.is_empty() {
        Worker::new(ctx)
    } else {
        Worker::for_queues(ctx, queues)
    };

    if once {
        match worker.run_once().await? {
            Some(JobOutcome::Finished { job_id }) => println!("Finished {job_id}"),
            Some(JobOutcome::Failed { job_id, error }) => println!("Failed {job_id}: {error}"),
            None => println!("No job available"),
        }
        return Ok(());
    }

    info!("press ctrl-c to stop");
    worker
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_prune_parses_age() {
        let cli = Cli::try_parse_from(["wikiselect", "jobs", "prune", "--older-than-days", "7"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Command::Jobs {
                action: JobsAction::Prune { older_than_days: 7 }
            }
        ));

        let cli = Cli::try_parse_from(["wikiselect", "jobs", "list", "--queue", "export"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Jobs {
                action: JobsAction::List { queue: Some(_) }
            }
        ));
    }
}
