//! Site-level behavior: budget hand-down, priority dispatch, channel
//! fan-in, and the demo preset wiring.

mod common;

use std::time::Duration;

use common::{
    build_loadpoint_raw, meter_device, test_config, threshold, TestCharger, TestMeter,
};
use gridpilot::config::Config;
use gridpilot::core::clock::Clock;
use gridpilot::core::loadpoint::Loadpoint;
use gridpilot::core::site::{Site, SiteConfig};
use gridpilot::core::types::{ChargeMode, ChargeStatus};
use gridpilot::device::registry::DriverRegistry;
use tokio::sync::mpsc::unbounded_channel;

/// Two loadpoints on one site: the first is charging at 6 A with a real
/// meter, the second is plugged in and waiting.
fn two_loadpoint_site(
    clock: &Clock,
    grid_watts: f64,
) -> (
    Site,
    std::sync::Arc<TestCharger>,
    std::sync::Arc<TestCharger>,
) {
    let mut cfg = test_config();
    cfg.enable = threshold(0.0, 0);
    cfg.disable = threshold(0.0, 0);

    let c1 = TestCharger::new(clock.clone());
    c1.set_status(ChargeStatus::C);
    c1.set_power(4140.0); // 6 A x 3 x 230 V
    let lp1 = build_loadpoint_raw(c1.clone(), clock.clone(), cfg.clone(), true);

    let c2 = TestCharger::new(clock.clone());
    c2.set_status(ChargeStatus::B);
    let lp2 = build_loadpoint_raw(c2.clone(), clock.clone(), cfg, false);

    let grid = TestMeter::new(grid_watts);
    let site = Site::new(
        SiteConfig {
            mode: ChargeMode::Pv,
            ..SiteConfig::default()
        },
        meter_device(grid),
        None,
        None,
        vec![lp1, lp2],
    );

    (site, c1, c2)
}

#[tokio::test]
async fn budget_hands_down_remaining_surplus() {
    let clock = Clock::manual();
    // 4840 W surplus: enough for the already-charging loadpoint plus a
    // 700 W remainder, which is below min-current power
    let (mut site, c1, c2) = two_loadpoint_site(&clock, -4840.0);

    let (ui_tx, _ui_rx) = unbounded_channel();
    let (push_tx, _push_rx) = unbounded_channel();
    site.prepare(ui_tx, push_tx);

    site.update().unwrap();

    assert!(c1.device_enabled(), "first loadpoint claims the surplus");
    assert!(
        !c2.device_enabled(),
        "second loadpoint must only see the 700 W remainder"
    );
}

#[tokio::test]
async fn priority_reorders_dispatch() {
    let clock = Clock::manual();
    let (mut site, _c1, c2) = two_loadpoint_site(&clock, -4840.0);

    let (ui_tx, _ui_rx) = unbounded_channel();
    let (push_tx, _push_rx) = unbounded_channel();
    site.prepare(ui_tx, push_tx);

    // served first, the waiting loadpoint sees the full surplus
    site.handle().loadpoints()[1].set_priority(5);
    site.update().unwrap();

    assert!(c2.device_enabled(), "higher priority is served first");
}

#[tokio::test]
async fn fan_in_stamps_loadpoint_index() {
    let clock = Clock::manual();
    let charger = TestCharger::new(clock.clone());
    charger.set_status(ChargeStatus::C);
    let lp = build_loadpoint_raw(charger, clock.clone(), test_config(), false);

    let grid = TestMeter::new(-2000.0);
    let mut site = Site::new(
        SiteConfig {
            mode: ChargeMode::Now,
            ..SiteConfig::default()
        },
        meter_device(grid),
        None,
        None,
        vec![lp],
    );

    let (ui_tx, mut ui_rx) = unbounded_channel();
    let (push_tx, mut push_rx) = unbounded_channel();
    site.prepare(ui_tx, push_tx);
    site.update().unwrap();

    let mut saw_site = false;
    let mut saw_loadpoint = false;
    while let Ok(Some(param)) =
        tokio::time::timeout(Duration::from_secs(1), ui_rx.recv()).await
    {
        match param.loadpoint {
            None if param.key == "sitePower" => saw_site = true,
            Some(0) => saw_loadpoint = true,
            _ => {}
        }
        if saw_site && saw_loadpoint {
            break;
        }
    }
    assert!(saw_site, "site-level params reach the global channel");
    assert!(saw_loadpoint, "loadpoint params carry their index");

    let event = tokio::time::timeout(Duration::from_secs(1), push_rx.recv())
        .await
        .expect("charge start event")
        .expect("channel open");
    assert_eq!(event.loadpoint, Some(0));
}

#[test]
fn meter_outage_fails_the_cycle_and_recovers() {
    let grid = TestMeter::new(300.0);
    let mut site = Site::new(
        SiteConfig::default(),
        meter_device(grid.clone()),
        None,
        None,
        Vec::new(),
    );

    grid.fail_next(3);
    assert!(site.update().is_err(), "exhausted retries fail the cycle");
    assert!(site.update().is_ok(), "next cycle recovers");
}

#[test]
fn demo_preset_builds_and_ticks() {
    let cfg = Config::demo();
    assert!(cfg.validate().is_empty());

    let registry = DriverRegistry::builtin();
    let grid_ref = &cfg.meters[&cfg.site.meters.grid];
    let grid = registry.meter(&grid_ref.kind, &grid_ref.params).unwrap();
    let pv_ref = &cfg.meters[cfg.site.meters.pv.as_ref().unwrap()];
    let pv = registry.meter(&pv_ref.kind, &pv_ref.params).unwrap();

    let lp_section = &cfg.loadpoints[0];
    let charger_ref = &cfg.chargers[&lp_section.charger];
    let charger = registry
        .charger(&charger_ref.kind, &charger_ref.params)
        .unwrap();
    let vehicle_ref = &cfg.vehicles[lp_section.vehicle.as_ref().unwrap()];
    let vehicle = registry
        .vehicle(&vehicle_ref.kind, &vehicle_ref.params)
        .unwrap();

    let loadpoint = Loadpoint::new(
        Clock::system(),
        lp_section.to_core(),
        cfg.site.voltage,
        charger,
        None,
        Some(vehicle.clone()),
        vec![vehicle],
    );

    let mut site = Site::new(
        cfg.site.to_core().unwrap(),
        grid,
        Some(pv),
        None,
        vec![loadpoint],
    );

    assert_eq!(site.loadpoint_count(), 1);
    assert!(site.update().is_ok());
}
