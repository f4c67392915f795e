use std::{collections::HashSet, path::Path, path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use warden_agent::{
    context::RunContext,
    error::OrchestratorError,
    monitor::StatusMonitor,
    registry::{ComponentRegistry, FileRegistry},
    report::{Action, EXIT_CONFIG, EXIT_FAILURE, RunReport, render_snapshot},
    scheduler::{self, Plan, Scheduler, Supervisor},
    settings::{BatchMode, Settings},
    support::format_error_chain,
};

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Start, stop and watch platform components")]
struct Cli {
    /// Component registry file (TOML or YAML).
    #[arg(long, env = "WARDEN_REGISTRY", default_value = "warden.toml", global = true)]
    registry: PathBuf,

    /// Debug output; repeat for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print the report as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Components to act on. All registered components when empty.
    components: Vec<String>,

    /// Report what would happen without spawning or signalling anything.
    #[arg(long)]
    dry_run: bool,

    /// Run the leaf batch one at a time.
    #[arg(long)]
    sequential: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    Start {
        #[command(flatten)]
        run: RunArgs,
        /// Replace components that already answer healthy.
        #[arg(long)]
        force: bool,
        /// Exit once started instead of supervising until Ctrl-C.
        #[arg(long)]
        detach: bool,
    },
    Stop {
        #[command(flatten)]
        run: RunArgs,
    },
    Restart {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        detach: bool,
    },
    Status {
        components: Vec<String>,
        /// Skip readiness, capability and CPU sampling.
        #[arg(long)]
        no_enrich: bool,
    },
    Watch {
        components: Vec<String>,
        #[arg(long)]
        interval_secs: Option<u64>,
    },
}

fn init_logging(verbose: u8, log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, "warden.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    let _log_guard = init_logging(cli.verbose, &settings.launch.log_dir);

    match run(cli, settings).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let config = matches!(
                e.downcast_ref::<OrchestratorError>(),
                Some(OrchestratorError::Configuration(_))
            );
            tracing::error!(error = %format_error_chain(&e), "warden aborted");
            eprintln!("warden: {}", format_error_chain(&e));
            ExitCode::from(if config { EXIT_CONFIG } else { EXIT_FAILURE })
        }
    }
}

async fn run(cli: Cli, mut settings: Settings) -> anyhow::Result<u8> {
    let registry = Arc::new(
        FileRegistry::load(&cli.registry).context("load component registry")?,
    );

    match cli.command {
        Command::Start { run, force, detach } => {
            apply_run_args(&mut settings, &run, detach);
            let ctx = Arc::new(build_context(settings, registry, run.dry_run, force)?);
            let plan = plan_for(&ctx, &run.components)?;
            let scheduler = scheduler_for(&ctx);
            let report = scheduler.start(&plan).await;
            emit(&report, cli.json)?;
            supervise(&ctx, &scheduler, &plan, report, run.dry_run || detach, cli.json).await
        }
        Command::Stop { run } => {
            apply_run_args(&mut settings, &run, false);
            let ctx = Arc::new(build_context(settings, registry, run.dry_run, false)?);
            let plan = plan_for(&ctx, &run.components)?;
            let report = scheduler_for(&ctx).stop(&plan).await;
            emit(&report, cli.json)?;
            Ok(report.exit_code())
        }
        Command::Restart { run, detach } => {
            apply_run_args(&mut settings, &run, detach);
            let ctx = Arc::new(build_context(settings, registry, run.dry_run, false)?);
            let plan = plan_for(&ctx, &run.components)?;
            let scheduler = scheduler_for(&ctx);
            let report = scheduler.restart(&plan).await;
            emit(&report, cli.json)?;
            supervise(&ctx, &scheduler, &plan, report, run.dry_run || detach, cli.json).await
        }
        Command::Status {
            components,
            no_enrich,
        } => {
            if no_enrich {
                settings.monitor.enrich = false;
            }
            let ctx = Arc::new(build_context(settings, registry, false, false)?);
            let specs = scheduler::select(ctx.registry.as_ref(), &components)?;
            let mut report = RunReport::new(ctx.run_id.clone(), Action::Status, false);
            report.status = Some(StatusMonitor::new(ctx.clone()).snapshot(&specs).await);
            let report = report.finish();
            emit(&report, cli.json)?;
            Ok(report.exit_code())
        }
        Command::Watch {
            components,
            interval_secs,
        } => {
            if let Some(secs) = interval_secs {
                settings.monitor.interval = Duration::from_secs(secs.max(1));
            }
            let interval = settings.monitor.interval;
            let ctx = Arc::new(build_context(settings, registry, false, false)?);
            let specs = scheduler::select(ctx.registry.as_ref(), &components)?;
            let adopted = ctx.adopt_running(&specs).await;
            tracing::info!(adopted, requested = specs.len(), "watching running components");

            let monitor = StatusMonitor::new(ctx.clone());
            if !cli.json {
                print!("{}", render_snapshot(&monitor.snapshot(&specs).await));
            }
            watch_until_interrupted(&monitor, interval, cli.json).await?;
            Ok(0)
        }
    }
}

fn apply_run_args(settings: &mut Settings, run: &RunArgs, detach: bool) {
    if run.sequential {
        settings.schedule.mode = BatchMode::Sequential;
    }
    if detach {
        settings.launch.detach = true;
    }
}

fn build_context(
    settings: Settings,
    registry: Arc<FileRegistry>,
    dry_run: bool,
    force: bool,
) -> anyhow::Result<RunContext> {
    let registry: Arc<dyn ComponentRegistry> = registry;
    Ok(RunContext::new(settings, registry)?
        .with_dry_run(dry_run)
        .with_force(force))
}

fn plan_for(ctx: &RunContext, requested: &[String]) -> anyhow::Result<Plan> {
    let specs = scheduler::select(ctx.registry.as_ref(), requested)?;
    Ok(scheduler::plan(&specs, &ctx.core_hierarchy(), |s| ctx.is_core(s))?)
}

fn scheduler_for(ctx: &Arc<RunContext>) -> Scheduler<Supervisor> {
    Scheduler::new(Supervisor::new(ctx.clone()), ctx.settings.schedule.clone())
        .with_run(ctx.run_id.clone(), ctx.dry_run)
}

fn emit(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if let Some(err) = report.error() {
        tracing::warn!(code = err.code(), "{err}");
    }
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("serialize report")?
        );
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

/// Attached runs keep piping component output until Ctrl-C, then stop what this run spawned.
async fn supervise(
    ctx: &Arc<RunContext>,
    scheduler: &Scheduler<Supervisor>,
    plan: &Plan,
    report: RunReport,
    detached: bool,
    json: bool,
) -> anyhow::Result<u8> {
    let start_code = report.exit_code();
    let spawned: HashSet<_> = ctx
        .launched
        .list()
        .await
        .into_iter()
        .filter(|c| !c.adopted)
        .map(|c| c.spec.id)
        .collect();
    if detached || spawned.is_empty() {
        return Ok(start_code);
    }

    tracing::info!(count = spawned.len(), "supervising; press Ctrl-C to stop");
    let monitor = StatusMonitor::new(ctx.clone());
    watch_until_interrupted(&monitor, ctx.settings.monitor.interval, json).await?;

    let owned = Plan {
        core: plan.core.iter().filter(|s| spawned.contains(&s.id)).cloned().collect(),
        leaf: plan.leaf.iter().filter(|s| spawned.contains(&s.id)).cloned().collect(),
    };
    let stop = scheduler.stop(&owned).await;
    emit(&stop, json)?;
    Ok(start_code.max(stop.exit_code()))
}

async fn watch_until_interrupted(
    monitor: &StatusMonitor,
    interval: Duration,
    json: bool,
) -> anyhow::Result<()> {
    let mut handle = monitor.watch(interval);
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("listen for Ctrl-C")?;
                break;
            }
            Some(t) = handle.transitions.recv() => {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "component": t.component_id,
                            "from": t.from,
                            "to": t.to,
                            "at": t.at,
                        })
                    );
                } else {
                    println!("{} {}: {:?} -> {:?}", t.at, t.component_id, t.from, t.to);
                }
            }
        }
    }
    tracing::info!("interrupted");
    handle.stop().await;
    Ok(())
}
