use clap::Parser;
use cobus_core::BusError;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "CoBus model runner", long_about = None)]
struct Args {
    /// Model instance name(s) to run, ';' delimited (default: all)
    #[arg(long)]
    name: Option<String>,

    /// Transport selector (overrides the Stack)
    #[arg(long)]
    transport: Option<String>,

    /// Transport URI (overrides the Stack)
    #[arg(long)]
    uri: Option<String>,

    /// Simulation step size in seconds
    #[arg(long)]
    stepsize: Option<f64>,

    /// Simulation end time in seconds
    #[arg(long)]
    endtime: Option<f64>,

    /// Transport timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Endpoint UID
    #[arg(long)]
    uid: Option<u32>,

    /// Log level (1=debug .. 5=quiet)
    #[arg(long, default_value = "3")]
    logger: u8,

    /// Simulation YAML files
    #[arg(required = true)]
    yaml: Vec<PathBuf>,
}

fn init_logging(logger: u8) {
    use tracing_subscriber::filter::LevelFilter;
    let level = match logger {
        1 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        3 => LevelFilter::WARN,
        4 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<BusError>() {
        Some(BusError::Cancelled) => 125,           // ECANCELED
        Some(BusError::Config(_)) => 22,            // EINVAL
        Some(BusError::Protocol(_)) => 71,          // EPROTO
        Some(BusError::Transport(_)) => 5,          // EIO
        Some(BusError::Model { .. }) => 70,
        Some(BusError::GatewayBehind { .. }) => 62, // ETIME
        None => 22,
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let docs = cobus_config::DocumentSet::from_files(&args.yaml)?;
    let overrides = cobus_config::SimulationOverrides {
        transport: args.transport.clone(),
        uri: args.uri.clone(),
        uid: args.uid,
        timeout: args.timeout,
        step_size: args.stepsize,
        end_time: args.endtime,
        names: args
            .name
            .as_deref()
            .map(|n| n.split(';').map(str::to_string).collect())
            .unwrap_or_default(),
    };
    let sim = cobus_config::resolve_simulation(&docs, &overrides)?;
    if !sim.mode_loopback {
        anyhow::bail!(BusError::Config(format!(
            "Transport '{}' has no linked wire implementation; use 'loopback'",
            sim.transport
        )));
    }

    info!("Simulation: {} instance(s)", sim.instances.len());
    info!("Step size: {}, end time: {}", sim.step_size, sim.end_time);
    for inst in &sim.instances {
        info!("  instance: {} (uid={})", inst.name, inst.uid);
    }

    let resolver = cobus_loader::DefaultResolver;
    let mut runtime = cobus_core::runtime::Runtime::new(sim, &resolver)
        .map_err(anyhow::Error::new)?;
    let result = runtime.run_to_end().map_err(anyhow::Error::new);
    runtime.exit().map_err(anyhow::Error::new)?;
    result?;

    info!("Simulation complete (model_time={})", runtime.model_time);
    Ok(())
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap handles --help/--version itself.
            if e.use_stderr() {
                eprintln!("{}", e);
                std::process::exit(22); // EINVAL
            }
            e.exit();
        }
    };
    init_logging(args.logger);
    info!("Starting CoBus model runner");

    if let Err(e) = run(&args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}
