//! Wildmesh Command-Line Interface
//!
//! This CLI provides tools for:
//! - Simulating a mesh of sensor nodes over a virtual radio medium
//! - Printing and validating node configuration files
//! - Decoding captured mesh frames

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use wildmesh_core::config::MeshConfig;
use wildmesh_core::message::Message;
use wildmesh_core::packet::Envelope;
use wildmesh_core::simulation::{MeshSimulator, SimConfig, SimReport, Topology};

#[derive(Parser)]
#[command(name = "wildmesh")]
#[command(author, version, about = "Sensor mesh protocol tools", long_about = None)]
struct Cli {
    /// Enable verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a mesh network with multiple nodes
    Simulate {
        /// Number of nodes to simulate
        #[arg(short, long, default_value = "6")]
        nodes: usize,

        /// Topology (line, ring, grid, random)
        #[arg(short, long, default_value = "line")]
        topology: String,

        /// Grid width for the grid topology
        #[arg(long, default_value = "3")]
        columns: usize,

        /// Link radius for the random topology
        #[arg(long, default_value = "1.5")]
        radius: f64,

        /// Simulated duration in seconds
        #[arg(short, long, default_value = "1800")]
        duration: u64,

        /// Simulated milliseconds per step
        #[arg(long, default_value = "250")]
        step_ms: u64,

        /// Per-link frame loss probability (0.0 - 1.0)
        #[arg(long, default_value = "0.0")]
        loss: f64,

        /// Drop frames that collide at a receiver
        #[arg(long)]
        collisions: bool,

        /// Largest initial clock offset in milliseconds
        #[arg(long, default_value = "5000")]
        skew_ms: i64,

        /// Largest clock drift in ppm
        #[arg(long, default_value = "20.0")]
        drift_ppm: f64,

        /// Probability per step that a node sends application data
        #[arg(long, default_value = "0.01")]
        message_rate: f64,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Node configuration template (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default node configuration as JSON
    Config,

    /// Validate a node configuration file
    CheckConfig {
        /// Configuration file (JSON)
        file: PathBuf,
    },

    /// Decode a captured frame (hex)
    Decode {
        /// Frame bytes in hex; spaces and colons are ignored
        hex: String,
    },
}

fn parse_topology(name: &str, columns: usize, radius: f64) -> Result<Topology> {
    match name.to_lowercase().as_str() {
        "line" => Ok(Topology::Line),
        "ring" => Ok(Topology::Ring),
        "grid" => {
            if columns == 0 {
                bail!("--columns must be at least 1");
            }
            Ok(Topology::Grid { columns })
        }
        "random" => {
            if radius <= 0.0 {
                bail!("--radius must be positive");
            }
            Ok(Topology::RandomGeometric { radius })
        }
        other => bail!("Unknown topology: {}. Use line, ring, grid or random", other),
    }
}

fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if digits.len() % 2 != 0 {
        bail!("Hex input has an odd number of digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn cmd_simulate(
    nodes: usize,
    topology: Topology,
    duration_secs: u64,
    step_ms: u64,
    loss: f64,
    collisions: bool,
    skew_ms: i64,
    drift_ppm: f64,
    message_rate: f64,
    seed: u64,
    config: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    if nodes == 0 {
        bail!("--nodes must be at least 1");
    }
    let template = match config {
        Some(path) => MeshConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => MeshConfig::default(),
    };

    let sim_config = SimConfig::default()
        .with_node_count(nodes)
        .with_topology(topology.clone())
        .with_step_ms(step_ms)
        .with_loss(loss)
        .with_collisions(collisions)
        .with_clock_skew(skew_ms, drift_ppm)
        .with_message_rate(message_rate)
        .with_seed(seed)
        .with_node_config(template);
    let mut sim = MeshSimulator::new(sim_config).context("Failed to build simulation")?;

    if !json {
        println!("=== Wildmesh Network Simulation ===");
        println!();
        println!("Nodes:     {}", nodes);
        println!("Topology:  {:?}", topology);
        println!("Duration:  {} s (step {} ms)", duration_secs, step_ms);
        println!("Loss:      {:.1}%", loss * 100.0);
        println!("Skew:      ±{} ms, ±{:.1} ppm", skew_ms, drift_ppm);
        println!("Seed:      {}", seed);
        println!();
    }

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let started = Instant::now();
    let total_ms = duration_secs.saturating_mul(1000);
    let chunk_ms = 60_000;
    let mut elapsed_ms = 0;
    while elapsed_ms < total_ms {
        if !running.load(Ordering::SeqCst) {
            warn!(elapsed_ms, "simulation interrupted");
            break;
        }
        let chunk = chunk_ms.min(total_ms - elapsed_ms);
        sim.run_for(chunk);
        elapsed_ms += chunk;
        info!(
            simulated_s = elapsed_ms / 1000,
            joined = sim.report().joined,
            coordinators = sim.coordinators().len(),
            "progress"
        );
    }
    info!(wall_ms = started.elapsed().as_millis() as u64, "simulation finished");

    let report = sim.report();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimReport) {
    println!("=== Simulation Results ===");
    println!();
    println!("Simulated time:      {} s", report.elapsed_ms / 1000);
    println!("Joined nodes:        {}/{}", report.joined, report.nodes);
    println!(
        "Coordinators:        {}",
        report
            .coordinators
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Synchronized nodes:  {}/{}", report.synchronized, report.nodes);
    println!("Time disagreement:   {} ms", report.max_time_disagreement_ms);
    println!();
    let s = &report.stats;
    println!("Frames transmitted:  {}", s.frames_transmitted);
    println!("Frames delivered:    {}", s.frames_delivered);
    println!("Frames lost:         {}", s.frames_lost);
    println!("Collisions:          {}", s.collisions);
    println!("Frame success rate:  {:.1}%", s.frame_success_rate() * 100.0);
    println!("Payloads sent:       {}", s.payloads_sent);
    println!("Payloads delivered:  {}", s.payloads_delivered);
    println!();

    println!("Per-Node Status:");
    println!(
        "{:<10} {:<7} {:<7} {:<10} {:<5} {:<7} {:<6} {:<8}",
        "Node ID", "Joined", "Coord", "Leader", "Nbrs", "Routes", "Strat", "Err(ms)"
    );
    println!("{}", "-".repeat(68));
    for n in &report.per_node {
        println!(
            "{:<10} {:<7} {:<7} {:<10} {:<5} {:<7} {:<6} {:<8}",
            n.node_id.to_string(),
            if n.joined { "yes" } else { "no" },
            if n.is_coordinator { "*" } else { "" },
            n.coordinator.to_string(),
            n.neighbors,
            n.routes,
            n.stratum,
            n.time_error_ms
        );
    }
}

fn cmd_config() -> Result<()> {
    let json = MeshConfig::default()
        .to_json_pretty()
        .context("Failed to render configuration")?;
    println!("{}", json);
    Ok(())
}

fn cmd_check_config(file: PathBuf) -> Result<()> {
    let config = MeshConfig::load(&file)
        .with_context(|| format!("Invalid configuration {}", file.display()))?;
    println!("{}: ok (node {})", file.display(), config.node_id);
    Ok(())
}

fn cmd_decode(hex: String) -> Result<()> {
    let bytes = parse_hex(&hex)?;
    let env = Envelope::from_bytes(&bytes).context("Frame rejected")?;

    println!("=== Mesh Frame ===");
    println!();
    println!("Type:         {} (0x{:02x})", env.message_type.name(), env.message_type.as_byte());
    println!("Source:       {}", env.source);
    println!("Last hop:     {}", env.last_hop);
    println!("Destination:  {}", env.destination);
    println!("Sequence:     {}", env.sequence);
    println!("Hops:         {}/{}", env.hop_count, env.max_hops);
    println!("Timestamp:    {} ms", env.timestamp);
    println!("Payload:      {} bytes", env.payload.len());
    println!();

    match Message::decode(env.message_type, &env.payload) {
        Ok(Message::Data(data)) => {
            println!("Data: {:?}", String::from_utf8_lossy(&data));
        }
        Ok(message) => println!("{:#?}", message),
        Err(e) => {
            warn!(error = %e, "payload did not decode");
            println!("Payload error: {}", e);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins when set
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(LevelFilter::from_level(log_level).to_string()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            topology,
            columns,
            radius,
            duration,
            step_ms,
            loss,
            collisions,
            skew_ms,
            drift_ppm,
            message_rate,
            seed,
            config,
            json,
        } => {
            let topology = parse_topology(&topology, columns, radius)?;
            cmd_simulate(
                nodes,
                topology,
                duration,
                step_ms,
                loss,
                collisions,
                skew_ms,
                drift_ppm,
                message_rate,
                seed,
                config,
                json,
            )
        }
        Commands::Config => cmd_config(),
        Commands::CheckConfig { file } => cmd_check_config(file),
        Commands::Decode { hex } => cmd_decode(hex),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wildmesh_core::message::Message;
    use wildmesh_core::packet::{MessageType, NodeId};

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0a:ff 10").unwrap(), vec![0x0a, 0xff, 0x10]);
        assert_eq!(parse_hex("0x0102").unwrap(), vec![1, 2]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_topology() {
        assert_eq!(parse_topology("Ring", 3, 1.0).unwrap(), Topology::Ring);
        assert_eq!(
            parse_topology("grid", 4, 1.0).unwrap(),
            Topology::Grid { columns: 4 }
        );
        assert!(parse_topology("star", 3, 1.0).is_err());
        assert!(parse_topology("random", 3, 0.0).is_err());
    }

    #[test]
    fn test_decoded_frame_matches_hex() {
        let env = Envelope {
            message_type: MessageType::Data,
            source: NodeId::from_u32(0x0A00_0001),
            last_hop: NodeId::from_u32(0x0A00_0001),
            destination: NodeId::BROADCAST,
            sequence: 9,
            hop_count: 0,
            max_hops: 8,
            timestamp: 1234,
            payload: Message::Data(b"hi".to_vec()).encode(),
        };
        let hex: String = env
            .to_bytes()
            .unwrap()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        let parsed = Envelope::from_bytes(&parse_hex(&hex).unwrap()).unwrap();
        assert_eq!(parsed, env);
    }
}
