//! # raftsim
//!
//! why: run a simulated cluster from a terminal without writing a harness
//! relations: drives raftsim-engine directly in virtual time, or through its tokio runtime
//! what: `simulate` and `live` subcommands, config file with flag overrides, event printing

mod output;

use std::error::Error;
use std::path::PathBuf;
use std::time::{Duration, TryFromFloatSecsError};

use clap::{Parser, Subcommand};
use raftsim_engine::{runtime, EngineHandle, SimConfig, Simulation};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use output::{EventPrinter, OutputFormat};

const MIN_WALL_PERIOD: Duration = Duration::from_millis(1);

#[derive(Parser, Debug)]
#[command(name = "raftsim")]
#[command(version)]
#[command(about = "Simulated Raft clusters with fault injection")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run in virtual time, as fast as the machine allows
    Simulate(RunArgs),

    /// Run paced against the wall clock
    Live {
        #[command(flatten)]
        run: RunArgs,

        /// Simulated milliseconds per wall-clock millisecond
        #[arg(long, default_value = "1.0")]
        time_scale: f64,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON config file; the flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of nodes in the cluster
    #[arg(long, short = 'n', default_value = "5")]
    nodes: usize,

    /// Cluster id
    #[arg(long, default_value = "cluster-1")]
    cluster: String,

    /// RNG seed; a random seed is drawn and logged when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// How long to run, in simulated milliseconds
    #[arg(long, short = 'd', default_value = "60000")]
    duration_ms: u64,

    /// Start the chaos scheduler on the cluster
    #[arg(long)]
    chaos: bool,

    /// Submit a client command every this many simulated ms (0 disables)
    #[arg(long, default_value = "0")]
    command_interval_ms: u64,

    /// Also print message-sent events
    #[arg(long)]
    messages: bool,

    /// Output format
    #[arg(long, short = 'o', value_enum, default_value = "text")]
    output: OutputFormat,
}

impl RunArgs {
    fn sim_config(&self) -> raftsim_engine::Result<SimConfig> {
        let mut config = match &self.config {
            Some(path) => SimConfig::from_json_file(path)?,
            None => SimConfig::default(),
        };
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.validate()?;
        Ok(config)
    }

    fn node_ids(&self) -> impl Iterator<Item = String> {
        (1..=self.nodes).map(|i| format!("node-{i}"))
    }
}

/// Client commands cycle over a handful of keys
fn next_command(seq: u64) -> String {
    format!("SET k{}={seq}", seq % 8)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Simulate(run) => simulate(run),
        Commands::Live { run, time_scale } => live(run, time_scale).await,
    }
}

// =============================================================================
// Virtual time
// =============================================================================

fn simulate(args: RunArgs) -> Result<(), Box<dyn Error>> {
    let mut sim = Simulation::new(args.sim_config()?)?;
    let mut events = sim.subscribe();
    let mut printer = EventPrinter::stdout(args.output, args.messages);

    for node_id in args.node_ids() {
        sim.register_node(&args.cluster, &node_id)?;
    }
    if args.chaos {
        sim.start_chaos(&args.cluster);
    }
    printer.drain(&mut events)?;

    let interval = args.command_interval_ms;
    let mut command_due = interval;
    let mut submitted = 0;
    while sim.now_ms() < args.duration_ms {
        let stop = if interval > 0 {
            command_due.min(args.duration_ms)
        } else {
            args.duration_ms
        };
        // one event at a time keeps the broadcast buffer from lagging
        match sim.next_due_ms() {
            Some(due) if due <= stop => {
                sim.step();
            }
            _ => sim.advance_to(stop),
        }

        if interval > 0 && sim.now_ms() >= command_due {
            let command = next_command(submitted);
            match sim.add_log_entry(&args.cluster, &command) {
                Ok(entry) => {
                    submitted += 1;
                    tracing::debug!(index = entry.index, term = entry.term, %command, "command submitted");
                }
                Err(e) => tracing::debug!(error = %e, "command skipped"),
            }
            command_due += interval;
        }
        printer.drain(&mut events)?;
    }

    printer.summary(&sim.stats(), &sim.nodes(&args.cluster))?;
    Ok(())
}

// =============================================================================
// Wall-clock time
// =============================================================================

async fn live(args: RunArgs, time_scale: f64) -> Result<(), Box<dyn Error>> {
    let sim = Simulation::new(args.sim_config()?)?;
    let (handle, task) = runtime::spawn(sim, time_scale)?;
    let mut events = handle.subscribe();
    let mut printer = EventPrinter::stdout(args.output, args.messages);

    for node_id in args.node_ids() {
        handle.register_node(&args.cluster, &node_id).await?;
    }
    if args.chaos {
        handle.start_chaos(&args.cluster).await?;
    }

    let deadline = tokio::time::sleep(wall_period(args.duration_ms, time_scale)?);
    tokio::pin!(deadline);
    let interval = args.command_interval_ms;
    let mut commands = tokio::time::interval(wall_period(interval, time_scale)?);
    // the first tick completes immediately
    commands.tick().await;
    let mut submitted = 0;

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) => printer.print(&event)?,
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = commands.tick(), if interval > 0 => {
                submit(&handle, &args.cluster, &mut submitted).await;
            }
        }
    }

    let stats = handle.stats().await?;
    let nodes = handle.nodes(&args.cluster).await?;
    handle.shutdown().await?;
    task.await?;
    printer.summary(&stats, &nodes)?;
    Ok(())
}

/// Wall-clock length of `sim_ms`, never shorter than a millisecond
fn wall_period(sim_ms: u64, time_scale: f64) -> Result<Duration, TryFromFloatSecsError> {
    let wall = Duration::try_from_secs_f64(sim_ms as f64 / time_scale / 1000.0)?;
    Ok(wall.max(MIN_WALL_PERIOD))
}

async fn submit(handle: &EngineHandle, cluster_id: &str, submitted: &mut u64) {
    let command = next_command(*submitted);
    match handle.add_log_entry(cluster_id, &command).await {
        Ok(entry) => {
            *submitted += 1;
            tracing::debug!(index = entry.index, term = entry.term, %command, "command submitted");
        }
        Err(e) => tracing::debug!(error = %e, "command skipped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "raftsim", "simulate", "-n", "3", "--seed", "9", "--chaos", "-o", "json",
        ]);
        let Commands::Simulate(run) = args.command else {
            panic!("expected simulate");
        };
        assert_eq!(run.node_ids().collect::<Vec<_>>(), ["node-1", "node-2", "node-3"]);
        assert!(run.chaos);
        assert_eq!(run.output, OutputFormat::Json);
        assert_eq!(run.sim_config().unwrap().seed, Some(9));
    }

    #[test]
    fn live_takes_a_time_scale() {
        let args = Args::parse_from(["raftsim", "live", "--time-scale", "10"]);
        assert!(matches!(args.command, Commands::Live { time_scale, .. } if time_scale == 10.0));
    }

    #[test]
    fn wall_period_scales_and_never_reaches_zero() {
        assert_eq!(wall_period(1_000, 2.0).unwrap(), Duration::from_millis(500));
        assert_eq!(wall_period(1, 1_000_000.0).unwrap(), MIN_WALL_PERIOD);
        assert_eq!(wall_period(0, 1.0).unwrap(), MIN_WALL_PERIOD);
    }

    #[test]
    fn commands_cycle_over_keys() {
        assert_eq!(next_command(0), "SET k0=0");
        assert_eq!(next_command(9), "SET k1=9");
    }
}
