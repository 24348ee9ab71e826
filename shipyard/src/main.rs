//! Backlog-item workflow engine.
//!
//! Items live under `.shipyard/items/` and move through research, planning,
//! implementation, delivery and completion. Every command re-reads the store,
//! so any run can be interrupted and resumed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use shipyard::agent::agent_from_config;
use shipyard::backlog::{Backlog, StoryStatus};
use shipyard::batch::{BatchEvent, BatchOptions, plan_batch, run_batch};
use shipyard::compute::{ComputeBackend, backend_from_config};
use shipyard::core::states::Phase;
use shipyard::doctor::{self, Report};
use shipyard::exit_codes;
use shipyard::interrupt::Interrupt;
use shipyard::io::backup::restore_session;
use shipyard::io::config::{AgentKind, Config, load_config};
use shipyard::io::gates::CommandGateRunner;
use shipyard::io::init::{InitOptions, init_store};
use shipyard::io::paths::{STORE_DIR, StorePaths};
use shipyard::io::review::GhCli;
use shipyard::io::store::Store;
use shipyard::item::Item;
use shipyard::logging;
use shipyard::phases::{OutcomeKind, PhaseContext, PhaseError, PhaseOutcome, run_item, run_next, run_phase};

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "shipyard",
    version,
    about = "Drive backlog items from idea to merged change with an AI coding agent"
)]
struct Cli {
    /// Repository to operate on (default: current directory).
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,
    /// Check preconditions and report what would run without running it.
    #[arg(long, global = true)]
    dry_run: bool,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Use the built-in mock agent instead of the configured one.
    #[arg(long, global = true)]
    mock_agent: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct ItemArgs {
    /// Item id, bare number, or unique slug prefix.
    id: String,
    /// Re-run even when the phase's artifacts already exist.
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create `.shipyard/` with a default config and prompt templates.
    Init {
        /// Overwrite existing config and templates (items are never touched).
        #[arg(short, long)]
        force: bool,
    },
    /// Create a new idea item.
    Add {
        title: String,
        #[arg(long)]
        overview: Option<String>,
        /// Item that must be done first (repeatable).
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        #[arg(long)]
        campaign: Option<String>,
    },
    /// List items with their state.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show one item and its stories.
    Show {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Research the codebase for an item (idea -> researched).
    Research(ItemArgs),
    /// Write the plan and backlog (researched -> planned).
    Plan(ItemArgs),
    /// Implement pending stories one per iteration.
    Implement(ItemArgs),
    /// Deliver the branch (review request or direct merge).
    Pr(ItemArgs),
    /// Record a merged review request (in_pr -> done).
    Complete(ItemArgs),
    /// Run exactly the next eligible phase.
    Next(ItemArgs),
    /// Run phases until done, awaiting merge, or a failure.
    Run(ItemArgs),
    /// Advance every non-terminal item, respecting dependencies.
    Batch {
        /// Worker count (default: `parallel` from config).
        #[arg(long)]
        parallel: Option<usize>,
        /// Start over instead of resuming a crashed batch.
        #[arg(long)]
        no_resume: bool,
        /// Re-queue items the resumed batch recorded as failed.
        #[arg(long)]
        retry_failed: bool,
    },
    /// Diagnose the store; `--fix` repairs what it can after backing up.
    Doctor {
        #[arg(long)]
        fix: bool,
    },
    /// Restore every file recorded in a backup session.
    Restore { session: String },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let interrupt = Interrupt::new();
    if let Err(err) = interrupt.install() {
        eprintln!("{err:#}");
        std::process::exit(exit_codes::FAILURE);
    }

    let code = match run(cli, &interrupt) {
        Ok(code) => code,
        Err(err) if is_interrupted(&err, &interrupt) => {
            eprintln!("interrupted");
            exit_codes::INTERRUPTED
        }
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILURE
        }
    };
    interrupt.run_cleanups(CLEANUP_TIMEOUT);
    std::process::exit(code);
}

fn is_interrupted(err: &anyhow::Error, interrupt: &Interrupt) -> bool {
    interrupt.is_set() || matches!(err.downcast_ref::<PhaseError>(), Some(PhaseError::Interrupted))
}

fn run(cli: Cli, interrupt: &Interrupt) -> Result<i32> {
    let cwd = match &cli.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let root = find_root(&cwd);

    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Doctor { fix } => cmd_doctor(&root, fix, cli.mock_agent),
        command => {
            let app = App::open(&root, cli.mock_agent)?;
            app.dispatch(command, cli.dry_run, interrupt)
        }
    }
}

/// Nearest ancestor holding a store, or `start` itself.
fn find_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(STORE_DIR).is_dir())
        .unwrap_or(start)
        .to_path_buf()
}

struct App {
    store: Store,
    config: Config,
}

impl App {
    fn open(root: &Path, mock_agent: bool) -> Result<Self> {
        let paths = StorePaths::new(root);
        if !paths.store_dir().is_dir() {
            bail!(
                "no {STORE_DIR}/ store in {} (run `shipyard init` first)",
                root.display()
            );
        }
        let mut config = load_config(&paths.config())?;
        if mock_agent {
            config.agent.kind = AgentKind::Mock;
        }
        let store = Store::new(paths, config.lock.settings());
        Ok(Self { store, config })
    }

    fn dispatch(&self, command: Command, dry_run: bool, interrupt: &Interrupt) -> Result<i32> {
        match command {
            Command::Add {
                title,
                overview,
                depends_on,
                campaign,
            } => self.cmd_add(&title, overview, &depends_on, campaign),
            Command::List { json } => self.cmd_list(json),
            Command::Show { id, json } => self.cmd_show(&id, json),
            Command::Research(args) => self.cmd_phase(Phase::Research, &args, dry_run, interrupt),
            Command::Plan(args) => self.cmd_phase(Phase::Plan, &args, dry_run, interrupt),
            Command::Implement(args) => self.cmd_phase(Phase::Implement, &args, dry_run, interrupt),
            Command::Pr(args) => self.cmd_phase(Phase::Pr, &args, dry_run, interrupt),
            Command::Complete(args) => self.cmd_phase(Phase::Complete, &args, dry_run, interrupt),
            Command::Next(args) => {
                let id = self.store.resolve_id(&args.id)?;
                self.with_context(dry_run, interrupt, |ctx| {
                    match run_next(ctx, &id, args.force)? {
                        Some(outcome) => print_outcome(&outcome),
                        None => println!("{id}: nothing to do"),
                    }
                    Ok(exit_codes::OK)
                })
            }
            Command::Run(args) => {
                let id = self.store.resolve_id(&args.id)?;
                self.with_context(dry_run, interrupt, |ctx| {
                    let outcomes = run_item(ctx, &id, args.force)?;
                    if outcomes.is_empty() {
                        println!("{id}: nothing to do");
                    }
                    outcomes.iter().for_each(print_outcome);
                    Ok(exit_codes::OK)
                })
            }
            Command::Batch {
                parallel,
                no_resume,
                retry_failed,
            } => {
                let options = BatchOptions {
                    parallel: parallel.unwrap_or(self.config.parallel),
                    resume: !no_resume,
                    retry_failed,
                    force: false,
                };
                if dry_run {
                    return self.cmd_batch_plan();
                }
                self.with_context(false, interrupt, |ctx| cmd_batch(ctx, &options))
            }
            Command::Restore { session } => {
                let restored = restore_session(self.store.paths(), &session)?;
                for path in &restored {
                    println!("restored {}", self.store.paths().relative(path));
                }
                println!("{} file(s) restored from {session}", restored.len());
                Ok(exit_codes::OK)
            }
            Command::Init { .. } | Command::Doctor { .. } => {
                bail!("init and doctor run without an open store")
            }
        }
    }

    /// Build the collaborators a phase needs and run `f` with them.
    fn with_context<T>(
        &self,
        dry_run: bool,
        interrupt: &Interrupt,
        f: impl FnOnce(&PhaseContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let agent = agent_from_config(&self.config.agent);
        let backend = backend_from_config(&self.config, agent);
        let review = GhCli::default();
        let gates = CommandGateRunner;
        let ctx = PhaseContext::new(
            &self.store,
            &self.config,
            backend.as_ref(),
            &review,
            &gates,
            interrupt,
        )
        .with_dry_run(dry_run);
        f(&ctx)
    }

    fn cmd_add(
        &self,
        title: &str,
        overview: Option<String>,
        depends_on: &[String],
        campaign: Option<String>,
    ) -> Result<i32> {
        let deps = depends_on
            .iter()
            .map(|dep| self.store.resolve_id(dep))
            .collect::<Result<Vec<_>>>()?;
        let item = self.store.create_item_with(title, Utc::now(), |item| {
            item.overview = overview.unwrap_or_default();
            item.depends_on = deps;
            item.campaign = campaign;
        })?;
        println!("{}", item.id);
        Ok(exit_codes::OK)
    }

    fn cmd_list(&self, json: bool) -> Result<i32> {
        let mut items = Vec::new();
        let mut broken = 0;
        for (id, result) in self.store.load_all()? {
            match result {
                Ok(item) => items.push(item),
                Err(err) => {
                    broken += 1;
                    eprintln!("{id}: unreadable ({err})");
                }
            }
        }
        if json {
            print_json(&items)?;
        } else {
            for item in &items {
                println!("{}", list_line(item));
            }
        }
        Ok(if broken == 0 {
            exit_codes::OK
        } else {
            exit_codes::FAILURE
        })
    }

    fn cmd_show(&self, input: &str, json: bool) -> Result<i32> {
        let id = self.store.resolve_id(input)?;
        let item = self.store.read_item(&id)?;
        let backlog = self.store.try_read_prd(&id)?;
        if json {
            #[derive(Serialize)]
            struct Shown<'a> {
                item: &'a Item,
                backlog: Option<&'a Backlog>,
            }
            print_json(&Shown {
                item: &item,
                backlog: backlog.as_ref(),
            })?;
            return Ok(exit_codes::OK);
        }
        println!("{}  {}", item.id, item.title);
        println!("state:   {}", item.state);
        if !item.overview.is_empty() {
            println!("overview: {}", item.overview);
        }
        if !item.depends_on.is_empty() {
            println!("depends: {}", item.depends_on.join(", "));
        }
        if let Some(branch) = &item.branch {
            println!("branch:  {branch}");
        }
        if let Some(url) = &item.pr_url {
            println!("review:  {url}");
        }
        if let Some(err) = &item.last_error {
            println!("error:   {err}");
        }
        if let Some(backlog) = &backlog {
            println!(
                "stories: {} pending of {}",
                backlog.pending_count(),
                backlog.user_stories.len()
            );
            for story in &backlog.user_stories {
                let mark = match story.status {
                    StoryStatus::Done => "x",
                    StoryStatus::Pending => " ",
                };
                println!("  [{mark}] {} (p{}) {}", story.id, story.priority, story.title);
            }
        }
        Ok(exit_codes::OK)
    }

    fn cmd_phase(
        &self,
        phase: Phase,
        args: &ItemArgs,
        dry_run: bool,
        interrupt: &Interrupt,
    ) -> Result<i32> {
        let id = self.store.resolve_id(&args.id)?;
        self.with_context(dry_run, interrupt, |ctx| {
            let outcome = run_phase(ctx, &id, phase, args.force)?;
            print_outcome(&outcome);
            Ok(exit_codes::OK)
        })
    }

    fn cmd_batch_plan(&self) -> Result<i32> {
        let plan = plan_batch(&self.store)?;
        for (id, phase) in &plan.ready {
            println!("ready    {id}: {phase}");
        }
        for (id, deps) in &plan.waiting {
            println!("waiting  {id}: on {}", deps.join(", "));
        }
        for id in &plan.blocked {
            println!("blocked  {id}: dependency cycle or missing dependency");
        }
        if plan.ready.is_empty() && plan.waiting.is_empty() && plan.blocked.is_empty() {
            println!("nothing to do");
        }
        Ok(exit_codes::OK)
    }
}

fn cmd_batch(ctx: &PhaseContext<'_>, options: &BatchOptions) -> Result<i32> {
    let report = run_batch(ctx, options, |event| match event {
        BatchEvent::Started { item_id, phase } => eprintln!("{item_id}: {phase} started"),
        BatchEvent::Advanced { outcome } => print_outcome(outcome),
        BatchEvent::Failed { item_id, error } => eprintln!("{item_id}: failed: {error}"),
    })?;
    if report.resumed {
        println!("resumed batch {}", report.session_id);
    }
    for (id, reason) in &report.skipped {
        println!("skipped  {id}: {reason}");
    }
    for (id, reason) in &report.failed {
        println!("failed   {id}: {reason}");
    }
    println!(
        "{} completed, {} failed, {} skipped, {} remaining",
        report.completed.len(),
        report.failed.len(),
        report.skipped.len(),
        report.remaining.len()
    );
    Ok(if report.interrupted {
        exit_codes::INTERRUPTED
    } else if report.failed.is_empty() {
        exit_codes::OK
    } else {
        exit_codes::FAILURE
    })
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let config = Config::default();
    let store = Store::new(StorePaths::new(root), config.lock.settings());
    let written = init_store(&store, &config, InitOptions { force })?;
    for path in &written {
        println!("wrote {}", store.paths().relative(path));
    }
    Ok(exit_codes::OK)
}

fn cmd_doctor(root: &Path, fix: bool, mock_agent: bool) -> Result<i32> {
    let paths = StorePaths::new(root);
    // Config problems are reported by the scan; build the backend from defaults then.
    let mut config = load_config(&paths.config()).unwrap_or_default();
    if mock_agent {
        config.agent.kind = AgentKind::Mock;
    }
    let store = Store::new(paths, config.lock.settings());
    let backend = backend_from_config(&config, agent_from_config(&config.agent));
    let backend: Option<&dyn ComputeBackend> = Some(backend.as_ref());

    let (report, scanned_config) = doctor::scan(&store, backend, Utc::now());
    print_report(&report);
    if !fix {
        return Ok(if report.is_healthy() {
            exit_codes::OK
        } else {
            exit_codes::FAILURE
        });
    }

    let repaired = doctor::repair(&store, &scanned_config, backend, &report, Utc::now())?;
    for result in &repaired.results {
        match &result.outcome {
            Ok(done) => println!("fixed    {done}"),
            Err(err) => println!("failed   {:?}: {err}", result.fix),
        }
    }
    if let Some(session) = &repaired.backup_session {
        println!("backup session {session} (undo with `shipyard restore {session}`)");
    }

    let (after, _) = doctor::scan(&store, backend, Utc::now());
    if !after.diagnostics.is_empty() {
        println!("after repair:");
        print_report(&after);
    }
    Ok(if after.is_healthy() && repaired.failed() == 0 {
        exit_codes::OK
    } else {
        exit_codes::FAILURE
    })
}

fn print_report(report: &Report) {
    for diagnostic in &report.diagnostics {
        println!("{diagnostic}");
    }
    println!(
        "{} error(s), {} warning(s), {} fixable",
        report.errors(),
        report.warnings(),
        report.fixable().count()
    );
}

fn print_outcome(outcome: &PhaseOutcome) {
    let prefix = match outcome.kind {
        OutcomeKind::DryRun => "[dry-run] ",
        OutcomeKind::Advanced | OutcomeKind::Skipped => "",
    };
    println!(
        "{prefix}{}: {} {} -> {}: {}",
        outcome.item_id, outcome.phase, outcome.from, outcome.to, outcome.message
    );
}

fn list_line(item: &Item) -> String {
    let mut line = format!("{:<28} {:<13} {}", item.id, item.state, item.title);
    if !item.depends_on.is_empty() {
        line.push_str(&format!(" (after {})", item.depends_on.join(", ")));
    }
    if item.last_error.is_some() {
        line.push_str(" [error]");
    }
    line
}

/// Pretty JSON with a trailing newline.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
