//! Charge controller entry point — CLI wiring and config-driven site
//! construction.

use std::path::Path;
use std::process;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridpilot::config::{Config, DriverConfig};
use gridpilot::core::clock::Clock;
use gridpilot::core::loadpoint::Loadpoint;
use gridpilot::core::site::Site;
use gridpilot::device::registry::DriverRegistry;
use gridpilot::device::{MeterDevice, Vehicle};

/// Parsed CLI arguments.
struct CliArgs {
    config_path: Option<String>,
    preset: Option<String>,
    interval_override: Option<u64>,
    #[cfg(feature = "api")]
    serve: bool,
    #[cfg(feature = "api")]
    port: u16,
}

fn print_help() {
    eprintln!("gridpilot — surplus-aware EV charge controller");
    eprintln!();
    eprintln!("Usage: gridpilot [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>          Load configuration from TOML file");
    eprintln!("  --preset <name>          Use a built-in preset (demo)");
    eprintln!("  --interval <secs>        Override the control loop interval");
    #[cfg(feature = "api")]
    {
        eprintln!("  --serve                  Start the REST API server");
        eprintln!("  --port <u16>             API server port (default: 7070)");
    }
    eprintln!("  --help                   Show this help message");
    eprintln!();
    eprintln!("If no --config or --preset is given, the demo preset is used.");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        preset: None,
        interval_override: None,
        #[cfg(feature = "api")]
        serve: false,
        #[cfg(feature = "api")]
        port: 7070,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --config requires a path argument");
                    process::exit(1);
                }
                cli.config_path = Some(args[i].clone());
            }
            "--preset" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --preset requires a name argument");
                    process::exit(1);
                }
                cli.preset = Some(args[i].clone());
            }
            "--interval" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --interval requires a seconds argument");
                    process::exit(1);
                }
                if let Ok(secs) = args[i].parse::<u64>() {
                    cli.interval_override = Some(secs);
                } else {
                    eprintln!("error: --interval value \"{}\" is not a valid u64", args[i]);
                    process::exit(1);
                }
            }
            #[cfg(feature = "api")]
            "--serve" => {
                cli.serve = true;
            }
            #[cfg(feature = "api")]
            "--port" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --port requires a u16 argument");
                    process::exit(1);
                }
                if let Ok(port) = args[i].parse::<u16>() {
                    cli.port = port;
                } else {
                    eprintln!("error: --port value \"{}\" is not a valid u16", args[i]);
                    process::exit(1);
                }
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

/// Builds the site from validated configuration: constructs every
/// referenced device through the registry and wires the loadpoints.
fn build_site(cfg: &Config, registry: &DriverRegistry, clock: Clock) -> Result<Site, String> {
    let build_meter = |name: &str| -> Result<MeterDevice, String> {
        let DriverConfig { kind, params } = cfg
            .meters
            .get(name)
            .ok_or_else(|| format!("unknown meter \"{name}\""))?;
        registry
            .meter(kind, params)
            .map_err(|err| format!("meter \"{name}\": {err}"))
    };

    let grid_meter = build_meter(&cfg.site.meters.grid)?;
    let pv_meter = cfg
        .site
        .meters
        .pv
        .as_deref()
        .map(&build_meter)
        .transpose()?;
    let battery_meter = cfg
        .site
        .meters
        .battery
        .as_deref()
        .map(&build_meter)
        .transpose()?;

    // all configured vehicles are identification candidates
    let mut vehicles: Vec<(String, Arc<dyn Vehicle>)> = Vec::new();
    for (name, DriverConfig { kind, params }) in &cfg.vehicles {
        let vehicle = registry
            .vehicle(kind, params)
            .map_err(|err| format!("vehicle \"{name}\": {err}"))?;
        vehicles.push((name.clone(), vehicle));
    }

    let mut loadpoints = Vec::new();
    for (id, section) in cfg.loadpoints.iter().enumerate() {
        let DriverConfig { kind, params } = cfg
            .chargers
            .get(&section.charger)
            .ok_or_else(|| format!("loadpoint {id}: unknown charger \"{}\"", section.charger))?;
        let charger = registry
            .charger(kind, params)
            .map_err(|err| format!("charger \"{}\": {err}", section.charger))?;

        let charge_meter = section
            .charge_meter
            .as_deref()
            .map(&build_meter)
            .transpose()?;

        let vehicle = match &section.vehicle {
            Some(name) => Some(
                vehicles
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| format!("loadpoint {id}: unknown vehicle \"{name}\""))?,
            ),
            None => None,
        };
        let candidates = vehicles.iter().map(|(_, v)| v.clone()).collect();

        loadpoints.push(Loadpoint::new(
            clock.clone(),
            section.to_core(),
            cfg.site.voltage,
            charger,
            charge_meter,
            vehicle,
            candidates,
        ));
    }

    let site_cfg = cfg.site.to_core()?;
    Ok(Site::new(
        site_cfg,
        grid_meter,
        pv_meter,
        battery_meter,
        loadpoints,
    ))
}

async fn run(cfg: Config, cli: CliArgs) {
    #[cfg(not(feature = "api"))]
    let _ = &cli;

    let registry = DriverRegistry::builtin();
    let mut site = match build_site(&cfg, &registry, Clock::system()) {
        Ok(site) => site,
        Err(err) => {
            eprintln!("error: {err}");
            process::exit(1);
        }
    };
    let handle = site.handle();

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    site.prepare(ui_tx, push_tx);
    info!(site = site.title(), loadpoints = site.loadpoint_count(), "prepared");

    // push events: session edges
    tokio::spawn(async move {
        while let Some(event) = push_rx.recv().await {
            info!(loadpoint = ?event.loadpoint, kind = ?event.kind, "push event");
        }
    });

    #[cfg(feature = "api")]
    let state = {
        let state = Arc::new(parking_lot::RwLock::new(gridpilot::api::SiteState::default()));
        tokio::spawn(gridpilot::api::collect(ui_rx, state.clone()));
        state
    };
    #[cfg(not(feature = "api"))]
    tokio::spawn(async move {
        let mut ui_rx = ui_rx;
        while let Some(param) = ui_rx.recv().await {
            tracing::trace!(loadpoint = ?param.loadpoint, key = %param.key, val = %param.val, "param");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let site_task = tokio::spawn(site.run(shutdown_rx));

    #[cfg(feature = "api")]
    if cli.serve {
        use std::net::SocketAddr;

        let app_state = Arc::new(gridpilot::api::AppState {
            state,
            handle: handle.clone(),
        });
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
        tokio::spawn(gridpilot::api::serve(app_state, addr));
    }

    // kick off the first cycle right away
    handle.poke();

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt, shutting down");
    }
    let _ = shutdown_tx.send(true);
    let _ = site_task.await;
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = parse_args();

    // load config: --config takes priority, then --preset, then demo
    let mut config = if let Some(ref path) = cli.config_path {
        match Config::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else if let Some(ref name) = cli.preset {
        match Config::from_preset(name) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        Config::demo()
    };

    if let Some(secs) = cli.interval_override {
        config.site.interval_secs = secs;
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("error: failed to create tokio runtime: {e}");
        process::exit(1);
    });
    rt.block_on(run(config, cli));
}
