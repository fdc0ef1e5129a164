//! Run command - execute one lifetime scenario

use anyhow::{anyhow, Context, Result};
use clap::{Args, ValueEnum};
use console::{style, Emoji};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tether_diagnostics::{JsonEmitter, ReportEmitter, TextEmitter};
use tether_runtime::{FinalizeOrder, RuntimeConfig};

use crate::scenarios::{self, Outcome};
use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Scenario to run (see `tether list`)
    pub scenario: String,

    /// Runtime config file (defaults to ./tether.toml when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Order of the collector's finalizer phases
    #[arg(long, value_enum)]
    pub finalize_order: Option<OrderArg>,

    /// Collect on every definition and call
    #[arg(long)]
    pub zeal: bool,

    /// Collect as soon as a context is destroyed
    #[arg(long)]
    pub collect_on_destroy: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OrderArg {
    CallablesFirst,
    GlobalsFirst,
}

impl From<OrderArg> for FinalizeOrder {
    fn from(order: OrderArg) -> Self {
        match order {
            OrderArg::CallablesFirst => FinalizeOrder::CallablesFirst,
            OrderArg::GlobalsFirst => FinalizeOrder::GlobalsFirst,
        }
    }
}

static STEP: Emoji<'_, '_> = Emoji("→ ", "- ");

const DEFAULT_CONFIG: &str = "tether.toml";

fn load_config(args: &RunArgs) -> Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => RuntimeConfig::load(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("loading config {}", DEFAULT_CONFIG))?,
        None => RuntimeConfig::default(),
    };

    // Flags override the file.
    if let Some(order) = args.finalize_order {
        config.gc.finalize_order = order.into();
    }
    if args.zeal {
        config.gc.zeal = true;
    }
    if args.collect_on_destroy {
        config.gc.collect_on_context_destroy = true;
    }
    Ok(config)
}

pub fn run(args: RunArgs, format: OutputFormat, use_color: bool, quiet: bool) -> Result<()> {
    let scenario = scenarios::find(&args.scenario)
        .ok_or_else(|| anyhow!("unknown scenario '{}' (see `tether list`)", args.scenario))?;
    let config = load_config(&args)?;
    log::debug!("config: {:?}", config);

    let outcome = scenario
        .execute(config.clone())
        .with_context(|| format!("scenario '{}' failed", scenario.name))?;
    let leaks = outcome.leaks();

    match format {
        OutputFormat::Text => print_text(scenario.name, &config, &outcome, use_color, quiet)?,
        OutputFormat::Json => print_json(scenario.name, &config, &outcome)?,
    }

    if !leaks.is_empty() {
        std::process::exit(1);
    }

    Ok(())
}

fn print_text(
    name: &str,
    config: &RuntimeConfig,
    outcome: &Outcome,
    use_color: bool,
    quiet: bool,
) -> Result<()> {
    if !quiet {
        if use_color {
            println!("{} {}", style("Scenario").bold(), style(name).cyan());
        } else {
            println!("Scenario {}", name);
        }
        println!(
            "finalize order {}, zeal {}, collect on destroy {}\n",
            config.gc.finalize_order, config.gc.zeal, config.gc.collect_on_context_destroy
        );

        for step in &outcome.trace.steps {
            if use_color {
                println!("  {}{}: {}", STEP, step.action, style(&step.outcome).green());
            } else {
                println!("  - {}: {}", step.action, step.outcome);
            }
        }

        let stats = &outcome.stats;
        println!(
            "\nengine: {} call(s), {} context touch(es), {} liveness quer(ies), {} collection(s)\n",
            stats.calls, stats.context_touches, stats.liveness_queries, stats.collections
        );
    }

    let stdout = io::stdout();
    let mut emitter = TextEmitter::new(stdout.lock(), use_color);
    if !quiet {
        emitter.emit_all(&outcome.trace.reports)?;
    }
    emitter.emit_summary(&outcome.trace.reports)?;
    Ok(())
}

fn print_json(name: &str, config: &RuntimeConfig, outcome: &Outcome) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let header = serde_json::json!({
        "type": "scenario",
        "name": name,
        "config": config,
    });
    serde_json::to_writer(&mut out, &header)?;
    writeln!(out)?;

    for step in &outcome.trace.steps {
        let line = serde_json::json!({
            "type": "step",
            "action": step.action,
            "outcome": step.outcome,
        });
        serde_json::to_writer(&mut out, &line)?;
        writeln!(out)?;
    }

    let stats = serde_json::json!({
        "type": "engine",
        "stats": outcome.stats,
    });
    serde_json::to_writer(&mut out, &stats)?;
    writeln!(out)?;

    let mut emitter = JsonEmitter::new(out);
    emitter.emit_all(&outcome.trace.reports)?;
    emitter.emit_summary(&outcome.trace.reports)?;
    Ok(())
}
