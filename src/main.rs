use clap::{Parser, Subcommand};
use dispatcher_core::api::ApiServer;
use dispatcher_core::config::Config;
use dispatcher_core::constants::CRON_TICK_INTERVAL_SECS;
use dispatcher_core::cron::{self, CronTrigger, FiredSet};
use dispatcher_core::handlers::{EventHandler, HandlerContext};
use dispatcher_core::models::{Repo, RepoSource, TaskType};
use dispatcher_core::queue::TaskQueue;
use dispatcher_core::registry::RepoRegistry;
use dispatcher_core::resolver::RepoResolver;
use dispatcher_core::runner::{self, Runner};
use dispatcher_core::schedule::{NullScheduleDrafter, ScheduleStore};
use dispatcher_core::session::SessionStore;
use dispatcher_core::trace::TraceStore;
use dispatcher_core::worker::{TaskCanceller, Worker};
use dispatcher_core::workspace::WorkspaceManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Parser)]
#[command(name = "dispatcher", about = "Chat-triggered autonomous coding-agent dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher service (default if no subcommand is given).
    Start,
    /// Write a starter config file if one doesn't already exist.
    Init,
    /// Check database reachability, configured repo count, and whether
    /// the configured runner binaries resolve on `PATH`.
    Doctor,
    /// Print usage help.
    Help,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Start) {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Init => run_init(),
        Command::Doctor => run_doctor().await,
        Command::Start => run_start().await,
    }
}

fn print_help() {
    println!("dispatcher — chat-triggered autonomous coding-agent dispatcher");
    println!();
    println!("USAGE:");
    println!("    dispatcher [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    start    Run the dispatcher service (default)");
    println!("    init     Write a starter config file if one doesn't exist");
    println!("    doctor   Run startup diagnostics");
    println!("    help     Print this message");
}

fn run_init() -> anyhow::Result<()> {
    let config_path = std::env::var("DISPATCHER_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let path = std::path::Path::new(&config_path);
    if path.exists() {
        println!("{config_path} already exists, leaving it untouched.");
        return Ok(());
    }

    let starter = serde_json::json!({
        "repos": {},
        "users": {},
        "claude": { "maxTurns": 20 },
        "reposDir": "./repos",
    });
    std::fs::write(path, serde_json::to_string_pretty(&starter)?)?;
    println!("Wrote a starter config to {config_path}.");
    println!("Add repos under \"repos\" and grant users access under \"users\" before running `dispatcher start`.");
    Ok(())
}

async fn run_doctor() -> anyhow::Result<()> {
    let mut ok = true;
    let config = match Config::load() {
        Ok(c) => {
            println!("[ok]   config loaded ({} repos, {} users)", c.repos.len(), c.users.len());
            c
        }
        Err(e) => {
            println!("[fail] config did not load: {e}");
            ok = false;
            return Err(anyhow::anyhow!("doctor checks failed"));
        }
    };

    match TaskQueue::new(config.database_path.clone()) {
        Ok(queue) => match queue.stats().await {
            Ok(stats) => println!(
                "[ok]   database reachable ({} pending, {} running, {} completed, {} failed)",
                stats.pending, stats.running, stats.completed, stats.failed
            ),
            Err(e) => {
                println!("[fail] database query failed: {e}");
                ok = false;
            }
        },
        Err(e) => {
            println!("[fail] database did not open: {e}");
            ok = false;
        }
    }

    for binary in ["claude", "codex"] {
        let env_var = format!("{}_BINARY_PATH", binary.to_uppercase());
        let resolved = std::env::var(&env_var).unwrap_or_else(|_| binary.to_string());
        if binary_on_path(&resolved) {
            println!("[ok]   runner binary '{resolved}' found on PATH");
        } else {
            println!("[warn] runner binary '{resolved}' not found on PATH (set {env_var} if it lives elsewhere)");
        }
    }

    if ok {
        println!("\ndoctor: all critical checks passed.");
        Ok(())
    } else {
        Err(anyhow::anyhow!("doctor found critical failures"))
    }
}

fn binary_on_path(name: &str) -> bool {
    if std::path::Path::new(name).is_absolute() {
        return std::path::Path::new(name).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

async fn run_start() -> anyhow::Result<()> {
    let config = Config::load()?;
    let db_path = config.database_path.clone();
    let repos_dir = config.repos_dir.clone();
    let (api_host, api_port, allowed_origins) =
        (config.api_host.clone(), config.api_port, config.allowed_origins.clone());

    let queue = TaskQueue::new(db_path.clone())?;
    let registry = RepoRegistry::new(db_path.clone())?;
    let session = SessionStore::new(db_path.clone())?;
    let schedules = ScheduleStore::new(db_path.clone())?;
    let trace = TraceStore::new(db_path.clone(), config.trace_enabled)?;

    for (name, entry) in &config.repos {
        registry
            .upsert(Repo {
                name: name.clone(),
                url: entry.url.clone(),
                owner: None,
                default_branch: entry.default_branch.clone(),
                source: RepoSource::Config,
                excluded: entry.excluded,
                last_synced_at: None,
            })
            .await?;
    }

    let claude_binary = std::env::var("CLAUDE_BINARY_PATH").unwrap_or_else(|_| "claude".to_string());
    let codex_binary = std::env::var("CODEX_BINARY_PATH").unwrap_or_else(|_| "codex".to_string());
    let mut runners: HashMap<String, Arc<dyn Runner>> = HashMap::new();
    runners.insert("claude-code".to_string(), Arc::from(runner::runner_for("claude-code", &claude_binary, &codex_binary)?));
    runners.insert("codex".to_string(), Arc::from(runner::runner_for("codex", &claude_binary, &codex_binary)?));
    let default_runner = config
        .runner
        .as_ref()
        .and_then(|r| r.name.clone())
        .unwrap_or_else(|| "claude-code".to_string());

    let workspace = WorkspaceManager::new(repos_dir.clone());
    let configured_max_turns = config.claude.max_turns;
    let mcp_config = config.mcp_servers.clone();

    let worker = Arc::new(Worker::new(
        queue.clone(),
        registry.clone(),
        workspace,
        trace.clone(),
        runners,
        default_runner,
        repos_dir,
        mcp_config,
        configured_max_turns,
    ));

    let config = Arc::new(RwLock::new(config));

    let handler_ctx = HandlerContext {
        config: config.clone(),
        queue: queue.clone(),
        registry: registry.clone(),
        session,
        schedules: schedules.clone(),
        resolver: RepoResolver::with_null_llm(),
        schedule_drafter: Arc::new(NullScheduleDrafter),
        canceller: worker.clone() as Arc<dyn TaskCanceller>,
    };
    let event_handler = Arc::new(EventHandler::new(handler_ctx));

    let api_server = ApiServer::new(
        config.clone(),
        queue.clone(),
        trace,
        event_handler,
        api_host,
        api_port,
        allowed_origins,
    );

    let cron_handle = tokio::spawn(run_cron_loop(schedules, config.clone(), queue));
    let sync_handle = tokio::spawn(run_registry_sync_loop(registry));

    tracing::info!("dispatcher starting");
    tokio::select! {
        _ = worker.run() => {
            tracing::error!("worker loop exited unexpectedly");
        }
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "webhook server failed");
            }
        }
    }

    cron_handle.abort();
    sync_handle.abort();
    Ok(())
}

/// Evaluate config-defined and user-created schedules once per tick,
/// enqueueing a `cron` task for every trigger due in the current minute.
async fn run_cron_loop(schedules: ScheduleStore, config: Arc<RwLock<Config>>, queue: TaskQueue) {
    let mut fired = FiredSet::new();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(CRON_TICK_INTERVAL_SECS));

    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();
        let key = cron::minute_key(now);
        if fired.contains(&key) {
            continue;
        }

        let mut triggers: Vec<CronTrigger> = Vec::new();
        if let Some(cron_cfg) = &config.read().await.cron {
            for s in &cron_cfg.schedules {
                triggers.push(CronTrigger {
                    schedule: s.schedule.clone(),
                    repo: s.repo.clone(),
                    prompt: s.prompt.clone(),
                    user_id: None,
                });
            }
        }
        match schedules.list_all().await {
            Ok(user_schedules) => {
                for s in user_schedules {
                    triggers.push(CronTrigger {
                        schedule: s.schedule,
                        repo: s.repo,
                        prompt: s.prompt,
                        user_id: Some(s.user_id),
                    });
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load user schedules for cron tick"),
        }

        match cron::due_triggers(&triggers, now) {
            Ok(due) if !due.is_empty() => {
                for trigger in due {
                    let user_id = trigger.user_id.clone().unwrap_or_else(|| "system:cron".to_string());
                    let repo = trigger.repo.clone().unwrap_or_else(|| "__none__".to_string());
                    tracing::info!(schedule = %trigger.schedule, repo = %repo, "cron schedule fired");
                    if let Err(e) = queue
                        .enqueue(user_id, repo, trigger.prompt, Some(TaskType::Cron), Some(2))
                        .await
                    {
                        tracing::error!(error = %e, "failed to enqueue cron task");
                    }
                }
                fired.insert(key);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cron evaluation failed"),
        }
    }
}

/// Periodically poll the registry's configured external source (a no-op
/// by default; see `RepoRegistry::with_sync_fn`) and upsert what it
/// returns.
async fn run_registry_sync_loop(registry: RepoRegistry) {
    use dispatcher_core::constants::DEFAULT_REGISTRY_SYNC_INTERVAL_SECS;
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(DEFAULT_REGISTRY_SYNC_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        match registry.sync_once().await {
            Ok(n) => tracing::debug!(count = n, "registry external-sync tick"),
            Err(e) => tracing::warn!(error = %e, "registry external-sync failed"),
        }
    }
}
