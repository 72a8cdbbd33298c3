use std::fs;

use gatenet::prelude::{Network, NetworkConfig, NetworkSnapshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const XOR: [([f64; 2], f64); 4] = [
    ([0.0, 0.0], 0.0),
    ([0.0, 1.0], 1.0),
    ([1.0, 0.0], 1.0),
    ([1.0, 1.0], 0.0),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        None | Some("--help") | Some("-h") | Some("help") => {
            print_help();
            Ok(())
        }
        Some("xor") => run_xor(args.get(2).map(String::as_str)),
        Some("run") => {
            let Some(path) = args.get(2) else {
                eprintln!("run: missing snapshot path");
                print_help();
                std::process::exit(2);
            };
            run_snapshot(path, &args[3..])
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(2);
        }
    }
}

fn print_help() {
    println!("gatenet (gated neural networks with a flattening compiler)");
    println!("usage:");
    println!("  gatenet xor [out.json]          train a 2-3-1 perceptron on XOR");
    println!("  gatenet run <snapshot> <x...>   activate a saved network (json or image)");
    println!("  gatenet help");
    println!();
    println!("RUST_LOG=debug shows compilation and restore events.");
}

fn run_xor(save: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = NetworkConfig::default()
        .with_seed(1)
        .with_weight_init(-1.0, 1.0);
    let mut net = Network::perceptron(2, &[3], 1, cfg)?;

    let rate = 0.3;
    let mut error = f64::INFINITY;
    for epoch in 0..20_000 {
        error = 0.0;
        for (input, target) in XOR {
            let out = net.activate(&input)?;
            net.propagate(rate, &[target])?;
            error += (target - out[0]).powi(2);
        }
        error /= XOR.len() as f64;
        if epoch % 1000 == 0 {
            info!(epoch, error, "training");
        }
        if error < 0.005 {
            info!(epoch, error, "converged");
            break;
        }
    }
    if error >= 0.005 {
        warn!(error, "did not converge");
    }

    for (input, target) in XOR {
        let out = net.activate(&input)?;
        println!("{input:?} -> {:.4} (target {target})", out[0]);
    }
    if let Some(program) = net.program() {
        println!(
            "flat program: {} slots, {} instructions",
            program.memory().len(),
            program.instruction_count()
        );
    }

    if let Some(path) = save {
        let json = net.to_snapshot()?.to_json_pretty()?;
        fs::write(path, json)?;
        info!(path, "saved snapshot");
    }
    Ok(())
}

fn run_snapshot(path: &str, values: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = fs::read(path)?;
    let snapshot = if bytes.starts_with(gatenet::storage::MAGIC) {
        NetworkSnapshot::from_image_bytes(&bytes)?
    } else {
        NetworkSnapshot::from_json(std::str::from_utf8(&bytes)?)?
    };
    let mut net = Network::from_snapshot(&snapshot, NetworkConfig::default())?;

    let input = values
        .iter()
        .map(|v| v.parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()?;
    let out = net.activate(&input)?;
    println!("{out:?}");
    Ok(())
}
