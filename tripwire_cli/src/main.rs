use tripwire_core::config::{ArrivalPhase, ModuleSpec, SimulationConfig, TripwireConfig};
use tripwire_core::control::apply_control;
use tripwire_core::registrar::MockRegistrar;
use tripwire_core::tracker::{CoverageTracker, ModuleEvent};

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Control-command file applied after the start-phase modules load;
    /// overrides the config's control lines.
    #[clap(long)]
    control_file: Option<PathBuf>,
    #[clap(long)]
    drain_timeout_ms: Option<u64>,
    #[clap(long)]
    fire_passes: Option<u32>,
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn main() -> Result<(), anyhow::Error> {
    init_logging();
    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}",);
            TripwireConfig::load_from_file(&config_path)?
        }
        None => {
            // No config file specified via CLI, load default
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}",
                );
                TripwireConfig::load_from_file(&default_config_path)?
            } else {
                println!(
                    "No config file specified and default 'config.toml' not found, using built-in defaults."
                );
                TripwireConfig::default()
            }
        }
    };

    if let Some(drain_timeout_ms) = cli.drain_timeout_ms {
        config
            .run
            .get_or_insert_with(Default::default)
            .drain_timeout_ms = drain_timeout_ms;
    }
    if let Some(fire_passes) = cli.fire_passes {
        config.run.get_or_insert_with(Default::default).fire_passes = fire_passes;
    }

    let mut simulation = config.simulation.take().unwrap_or_default();

    let control: Vec<u8> = match &cli.control_file {
        Some(path) => std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read control file at {:?}: {}", path, e))?,
        None if !simulation.control_lines.is_empty() => {
            let mut joined = simulation.control_lines.join("\n");
            joined.push('\n');
            joined.into_bytes()
        }
        None => Vec::new(),
    };

    // Nothing configured at all: fall back to a built-in demo scenario so a
    // bare invocation still shows the whole lifecycle.
    let (control, simulation) = if control.is_empty() && simulation.modules.is_empty() {
        println!("No control commands or modules configured, running the built-in demo scenario.");
        simulation = SimulationConfig {
            modules: vec![ModuleSpec {
                name: "mymod".to_string(),
                base_address: 0x1000,
                arrival: ArrivalPhase::AfterControl,
                departs_after_firing: false,
            }],
            control_lines: Vec::new(),
        };
        (b"4a0\nmymod:10\n".to_vec(), simulation)
    } else {
        (control, simulation)
    };

    let run = config.run.unwrap_or_default();

    let registrar = Arc::new(MockRegistrar::new());
    let tracker = CoverageTracker::new(registrar.clone());
    registrar.attach_sink(tracker.fire_sink());

    for module in &simulation.modules {
        if module.arrival == ArrivalPhase::Start {
            tracker.handle_module_event(ModuleEvent::Arriving {
                name: module.name.clone(),
                base_address: module.base_address,
            });
        }
    }

    // The control surface may consume a write only partially (clear and
    // empty lines end a batch); resubmit the tail until no progress is made.
    let mut offset = 0usize;
    while offset < control.len() {
        let consumed = apply_control(&tracker, &control[offset..]);
        if consumed == 0 {
            break;
        }
        offset += consumed;
    }
    println!(
        "Applied {} of {} control bytes. State: {:?}",
        offset,
        control.len(),
        tracker.stats()
    );

    for module in &simulation.modules {
        if module.arrival == ArrivalPhase::AfterControl {
            tracker.handle_module_event(ModuleEvent::Arriving {
                name: module.name.clone(),
                base_address: module.base_address,
            });
        }
    }
    println!("After module arrivals: {:?}", tracker.stats());

    let token = tracker.cancel_token();
    let drained = AtomicUsize::new(0);

    thread::scope(|scope| {
        let consumer = {
            let tracker = &tracker;
            let token = &token;
            let drained = &drained;
            scope.spawn(move || {
                while let Some(hit) = tracker.take_next(token) {
                    print!("{}", hit.render());
                    drained.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        for pass in 0..run.fire_passes {
            let mut addresses = registrar.armed_addresses();
            addresses.sort_unstable();
            let mut fired = 0;
            for address in addresses {
                if registrar.execute(address) {
                    fired += 1;
                }
            }
            println!("Fire pass {}: {} probes fired", pass + 1, fired);
        }

        for module in &simulation.modules {
            if module.departs_after_firing {
                tracker.handle_module_event(ModuleEvent::Departing {
                    name: module.name.clone(),
                });
            }
        }

        thread::sleep(Duration::from_millis(run.drain_timeout_ms));
        token.cancel();
        consumer.join().expect("consumer thread panicked");
    });

    println!(
        "Drained {} hits. Final state: {:?}. Probes registered: {}, released: {}, still armed: {}",
        drained.load(Ordering::SeqCst),
        tracker.stats(),
        registrar.registered_total(),
        registrar.released_total(),
        registrar.outstanding()
    );

    Ok(())
}
