//! In-process runner: every agent on its own thread, each attaching the
//! shared regions on its own exactly as a separate process would.

use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crate::agent::{DayClock, Exit, HazardDispatcher, PortAgent, ShipAgent};
use crate::config::WorldConfig;
use crate::context::Context;
use crate::core::{Error, RegionKey, Result};
use crate::hazard::Hazard;
use crate::report::Report;
use crate::world::World;

/// Which agent a thread ran and how it ended.
#[derive(Debug)]
pub struct AgentOutcome {
    pub agent: String,
    pub result: Result<Exit>,
}

pub struct Simulation {
    root: PathBuf,
    key: RegionKey,
    ctx: Context,
}

impl Simulation {
    /// Bootstraps a fresh world under `root`.
    pub fn create(root: &Path, key: RegionKey, config: &WorldConfig) -> Result<Self> {
        let ctx = Context::create(root, key, config)?;
        Ok(Self {
            root: root.to_path_buf(),
            key,
            ctx,
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn spawn<F>(&self, name: String, body: F) -> Result<(String, JoinHandle<Result<Exit>>)>
    where
        F: FnOnce(Context) -> Result<Exit> + Send + 'static,
    {
        let root = self.root.clone();
        let key = self.key;
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let ctx = Context::attach(&root, key)?;
            body(ctx)
        })?;
        Ok((name, handle))
    }

    fn spawn_all(&self, handles: &mut Vec<(String, JoinHandle<Result<Exit>>)>) -> Result<()> {
        let config = self.ctx.config();
        for id in 0..config.ports {
            handles.push(self.spawn(format!("port-{id}"), move |ctx| {
                PortAgent::new(ctx, id)?.run()
            })?);
        }
        for id in 0..config.ships {
            handles.push(self.spawn(format!("ship-{id}"), move |ctx| {
                ShipAgent::new(ctx, id)?.run()
            })?);
        }
        handles.push(self.spawn("weather".into(), |ctx| HazardDispatcher::new(ctx).run())?);
        handles.push(self.spawn("clock".into(), |ctx| DayClock::new(ctx).run())?);
        Ok(())
    }

    /// Runs every agent to completion and returns the final report plus how
    /// each agent ended.
    pub fn run(&self) -> Result<(Report, Vec<AgentOutcome>)> {
        let mut handles = Vec::new();
        let spawned = self.spawn_all(&mut handles);
        if spawned.is_err() {
            // Without the clock nothing would ever stop the agents already running.
            self.ctx.world.request_shutdown()?;
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (index, (agent, handle)) in handles.into_iter().enumerate() {
            let result = handle.join().unwrap_or_else(|_| {
                Err(Error::HazardFault {
                    agent: index,
                    hazard: Hazard::Fault.name(),
                })
            });
            if let Err(err) = &result {
                log::error!("{agent} failed: {err}");
            }
            outcomes.push(AgentOutcome { agent, result });
        }
        spawned?;
        Ok((Report::collect(&self.ctx)?, outcomes))
    }

    /// Destroys every region of the world.
    pub fn teardown(self) -> Result<()> {
        drop(self.ctx);
        World::purge(&self.root, self.key)
    }
}
