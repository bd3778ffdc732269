use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use tradewinds::agent::{PortAgent, ShipAgent};
use tradewinds::hazard::Hazard;
use tradewinds::records::ShipFlag;
use tradewinds::{Context, Error, RegionKey, WorldConfig};

#[test]
fn sunk_ship_frees_its_dock_for_the_next_one() -> tradewinds::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = WorldConfig {
        ports: 1,
        goods: 1,
        ships: 2,
        docks: 1,
        speed: 1.0e9,
        // Unloading 240 units at 1 unit/hour keeps the first ship docked for
        // ten 1-second days unless something cuts the visit short.
        load_speed: 1,
        min_size: 1,
        max_size: 1,
        day_length_ms: 1_000,
        seed: Some(13),
        ..WorldConfig::default()
    };
    let ctx = Context::create(dir.path(), RegionKey(0x40), &config)?;
    ctx.ledger.add_demand(0, 0, 240)?;

    let stop = Arc::new(AtomicBool::new(false));
    let port = {
        let ctx = ctx.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || -> tradewinds::Result<()> {
            let mut port = PortAgent::new(ctx, 0)?;
            while !stop.load(Ordering::Acquire) {
                port.step()?;
            }
            Ok(())
        })
    };

    let (docked_tx, docked_rx) = mpsc::channel();
    let first = {
        let ctx = ctx.clone();
        thread::spawn(move || -> tradewinds::Result<()> {
            let mut ship = ShipAgent::new(ctx, 0)?;
            ship.hold_mut().add(0, 240, 100);
            ship.sail_to(0)?;
            let guard = ship.dock()?;
            let _ = docked_tx.send(());
            ship.trade(guard)
        })
    };
    docked_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first ship docked");

    let (second_tx, second_rx) = mpsc::channel();
    let second = {
        let ctx = ctx.clone();
        thread::spawn(move || -> tradewinds::Result<()> {
            let mut ship = ShipAgent::new(ctx, 1)?;
            ship.sail_to(0)?;
            let _guard = ship.dock()?;
            let _ = second_tx.send(Instant::now());
            Ok(())
        })
    };
    // The second ship is stuck behind the first.
    assert!(second_rx.recv_timeout(Duration::from_millis(200)).is_err());

    let struck = Instant::now();
    ctx.ships.get(0)?.inbox().deliver(Hazard::Maelstrom)?;
    let docked_at = second_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second ship docks after the maelstrom");
    assert!(docked_at.duration_since(struck) < Duration::from_secs(2));

    match first.join().expect("first ship thread") {
        Err(Error::HazardFault { agent: 0, hazard }) => assert_eq!(hazard, "maelstrom"),
        other => panic!("expected maelstrom fault, got {other:?}"),
    }
    second.join().expect("second ship thread")?;
    stop.store(true, Ordering::Release);
    port.join().expect("port thread")?;

    assert_eq!(ctx.ships.get(0)?.maelstroms(), 1);
    assert!(!ctx.ships.get(1)?.flag(ShipFlag::Dead));
    assert_eq!(ctx.ports.get(0)?.dock().available(), 1);
    Ok(())
}
