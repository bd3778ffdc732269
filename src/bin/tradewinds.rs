use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};

use tradewinds::agent::{DayClock, Exit, HazardDispatcher, PortAgent, ShipAgent};
use tradewinds::{Context, RegionKey, Report, Simulation, World, WorldConfig, DEFAULT_WORLD_KEY};

#[derive(Parser)]
#[command(name = "tradewinds", version, about = "Shared-memory maritime trade simulation")]
struct Cli {
    /// Directory holding the shared regions.
    #[arg(long, global = true, default_value = "/dev/shm/tradewinds")]
    root: PathBuf,
    /// World registry key.
    #[arg(long, global = true, default_value_t = DEFAULT_WORLD_KEY.0)]
    key: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the world and every region it names.
    Init {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run one ship agent.
    Ship {
        #[arg(long)]
        id: usize,
    },
    /// Run one port agent.
    Port {
        #[arg(long)]
        id: usize,
    },
    /// Run the hazard dispatcher.
    Weather,
    /// Run the day clock.
    Clock,
    /// Print the telemetry report as JSON.
    Report,
    /// Destroy every region of the world.
    Teardown,
    /// Bootstrap, run every agent as a thread, report and tear down.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<WorldConfig> {
    match path {
        Some(path) => WorldConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(WorldConfig::default()),
    }
}

fn attach(root: &Path, key: RegionKey) -> Result<Context> {
    Context::attach(root, key).with_context(|| format!("attaching world under {}", root.display()))
}

fn finish(agent: &str, exit: tradewinds::Result<Exit>) -> Result<()> {
    let exit = exit.with_context(|| format!("{agent} failed"))?;
    log::info!("{agent} exited: {exit:?}");
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let key = RegionKey(cli.key);

    match cli.command {
        Commands::Init { config } => {
            let config = load_config(config.as_deref())?;
            Context::create(&cli.root, key, &config)?;
            log::info!("world ready under {}", cli.root.display());
        }
        Commands::Ship { id } => {
            let ctx = attach(&cli.root, key)?;
            if id >= ctx.config().ships {
                bail!("ship id {id} out of range ({} ships)", ctx.config().ships);
            }
            finish(&format!("ship {id}"), ShipAgent::new(ctx, id)?.run())?;
        }
        Commands::Port { id } => {
            let ctx = attach(&cli.root, key)?;
            if id >= ctx.config().ports {
                bail!("port id {id} out of range ({} ports)", ctx.config().ports);
            }
            finish(&format!("port {id}"), PortAgent::new(ctx, id)?.run())?;
        }
        Commands::Weather => {
            let ctx = attach(&cli.root, key)?;
            finish("weather", HazardDispatcher::new(ctx).run())?;
        }
        Commands::Clock => {
            let ctx = attach(&cli.root, key)?;
            finish("clock", DayClock::new(ctx).run())?;
        }
        Commands::Report => {
            let ctx = attach(&cli.root, key)?;
            println!("{}", Report::collect(&ctx)?.to_json()?);
        }
        Commands::Teardown => {
            World::purge(&cli.root, key)?;
            log::info!("world {:#010x} removed", key.0);
        }
        Commands::Run { config } => {
            let config = load_config(config.as_deref())?;
            let sim = Simulation::create(&cli.root, key, &config)?;
            let outcome = sim.run();
            sim.teardown()?;
            let (report, agents) = outcome?;
            for agent in &agents {
                if let Err(err) = &agent.result {
                    log::warn!("{}: {err}", agent.agent);
                }
            }
            println!("{}", report.to_json()?);
        }
    }
    Ok(())
}
