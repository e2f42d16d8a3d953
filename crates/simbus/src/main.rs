// CoBus - Cosimulation Signal Bus
// Copyright (C) 2026 CoBus Team
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use clap::Parser;
use cobus_core::adapter::simbus::SimBusAdapter;
use cobus_core::endpoint::loopback::LoopbackHub;
use cobus_core::endpoint::Endpoint;
use cobus_core::BusError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "CoBus standalone signal bus", long_about = None)]
struct Args {
    /// Transport selector (overrides the Stack)
    #[arg(long)]
    transport: Option<String>,

    /// Transport URI (overrides the Stack)
    #[arg(long)]
    uri: Option<String>,

    /// Bus step size in seconds
    #[arg(long)]
    stepsize: Option<f64>,

    /// Transport timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Endpoint UID
    #[arg(long, default_value = "1")]
    uid: u32,

    /// Log level (1=debug .. 5=quiet)
    #[arg(long, default_value = "3")]
    logger: u8,

    /// Stack/SignalGroup YAML files
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

fn run(args: &Args) -> anyhow::Result<()> {
    let docs = cobus_config::DocumentSet::from_files(&args.yaml)?;
    let stack = docs
        .stack()
        .ok_or_else(|| anyhow::anyhow!("No Stack document found"))?;

    let transport = args
        .transport
        .clone()
        .unwrap_or_else(|| stack.spec.connection.transport.clone());
    let timeout = args.timeout.unwrap_or(stack.spec.connection.timeout);
    let step_size = args
        .stepsize
        .or(stack.spec.runtime.stepsize)
        .unwrap_or(cobus_config::DEFAULT_STEP_SIZE);

    // Aggregate the expected channels over all stack models.
    let mut expected: BTreeMap<String, u32> = BTreeMap::new();
    for model in &stack.spec.models {
        for ch in &model.channels {
            let count = expected.entry(ch.name.clone()).or_default();
            *count = (*count).max(ch.expected_model_count.unwrap_or(1));
        }
    }
    if expected.is_empty() {
        anyhow::bail!(BusError::Config("Stack declares no channels".to_string()));
    }

    let endpoint = match transport.as_str() {
        cobus_config::TRANSPORT_LOOPBACK => {
            // Single-process bus; peers attach through the loopback hub.
            let hub = LoopbackHub::new();
            Endpoint::simbus(Box::new(hub.endpoint(args.uid, true)), args.uid, timeout)
        }
        other => anyhow::bail!(BusError::Config(format!(
            "Transport '{}' has no linked wire implementation",
            other
        ))),
    };

    let mut bus = SimBusAdapter::new(endpoint, step_size);
    for (name, count) in &expected {
        let signals: Vec<String> = docs
            .signal_group(name)
            .map(|g| g.spec.signals.iter().map(|s| s.signal.clone()).collect())
            .unwrap_or_default();
        info!(
            "Channel '{}': expectedModelCount={}, {} signal(s)",
            name,
            count,
            signals.len()
        );
        bus.init_channel(name, *count, &signals);
    }

    info!("SimBus running (step_size={})", step_size);
    bus.run().map_err(anyhow::Error::new)?;
    info!("SimBus loop terminated (all models exited)");
    Ok(())
}

fn exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<BusError>() {
        Some(BusError::Cancelled) => 125, // ECANCELED
        Some(BusError::Config(_)) => 22,  // EINVAL
        Some(BusError::Protocol(_)) => 71,
        Some(BusError::Transport(_)) => 5,
        _ => 22,
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            if e.use_stderr() {
                eprintln!("{}", e);
                std::process::exit(22); // EINVAL
            }
            e.exit();
        }
    };
    init_logging(args.logger);
    info!("Starting CoBus SimBus");

    if let Err(e) = run(&args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}
