use tradewinds::agent::Exit;
use tradewinds::{RegionKey, Simulation, WorldConfig};

#[test]
fn short_run_ends_cleanly_and_reports() -> tradewinds::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = WorldConfig {
        ports: 5,
        goods: 3,
        ships: 4,
        map_side: 200.0,
        speed: 400.0,
        docks: 1,
        fill: 300,
        days: 4,
        day_length_ms: 80,
        maelstrom: 30,
        reply_timeout_ms: Some(400),
        seed: Some(2024),
        ..WorldConfig::default()
    };
    let sim = Simulation::create(dir.path(), RegionKey(0x50), &config)?;
    let (report, agents) = sim.run()?;
    sim.teardown()?;

    assert_eq!(report.day, 4);
    assert_eq!(agents.len(), config.ports + config.ships + 2);
    for agent in &agents {
        match &agent.result {
            Ok(Exit::Terminated) | Ok(Exit::Sunk) => {}
            other => panic!("{} ended with {other:?}", agent.agent),
        }
    }
    let sunk = agents
        .iter()
        .filter(|agent| matches!(agent.result, Ok(Exit::Sunk)))
        .count();
    assert_eq!(report.fleet.dead, sunk);
    assert_eq!(report.maelstroms as usize, sunk);
    assert!(report.goods.iter().map(|good| good.stats.generated).sum::<i64>() > 0);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}
