// src/main.rs
//
// CommWatch CLI: record traffic to a JSON log, replay a log back onto a
// transport, or monitor live frames on the console.

use clap::{Args, Parser, Subcommand, ValueEnum};
use commwatch::codec::format_hex;
use commwatch::io::sim::SimMode;
use commwatch::{
    adapter_for, export, tlog, AdapterOpenOptions, DeviceInfo, DeviceType, Direction, Event,
    EventKind, SessionPipeline, SimulatorConfig,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Proto {
    Uart,
    Spi,
    I2c,
    Can,
    Ethernet,
}

impl From<Proto> for DeviceType {
    fn from(proto: Proto) -> DeviceType {
        match proto {
            Proto::Uart => DeviceType::Uart,
            Proto::Spi => DeviceType::Spi,
            Proto::I2c => DeviceType::I2c,
            Proto::Can => DeviceType::Can,
            Proto::Ethernet => DeviceType::Ethernet,
        }
    }
}

/// Transport selection shared by all subcommands.
#[derive(Args, Debug)]
struct TransportArgs {
    /// Transport family
    #[arg(long, value_enum)]
    proto: Proto,

    /// Serial port path (uart)
    #[arg(long)]
    port: Option<String>,

    /// Baud rate (uart)
    #[arg(long)]
    baud: Option<u32>,

    /// Interface name (can)
    #[arg(long)]
    iface: Option<String>,

    /// Remote host (ethernet)
    #[arg(long)]
    host: Option<String>,

    /// UDP/TCP port (ethernet)
    #[arg(long)]
    eth_port: Option<u16>,

    /// Decoder protocol id
    #[arg(long, default_value = "efuse")]
    decoder: String,

    /// Use the transport simulator instead of real hardware
    #[arg(long)]
    simulate: bool,
}

#[derive(Parser, Debug)]
#[command(name = "commwatch", version, about = "Multi-transport wire observer")]
struct Cli {
    /// Tee log output into a dated file under this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture traffic and write the JSON session log
    Record {
        #[command(flatten)]
        transport: TransportArgs,

        /// Output log file
        #[arg(long)]
        output: PathBuf,

        /// Capture duration in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
    /// Retransmit the tx frames of a JSON session log
    Replay {
        #[command(flatten)]
        transport: TransportArgs,

        /// Input log file
        #[arg(long)]
        input: PathBuf,

        /// Playback speed factor (2.0 = twice as fast)
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
    /// Print live frames until interrupted
    Monitor {
        #[command(flatten)]
        transport: TransportArgs,
    },
}

/// Build the device entry and open options from the CLI flags.
fn resolve_device(args: &TransportArgs) -> (DeviceInfo, AdapterOpenOptions) {
    let device_type: DeviceType = args.proto.into();
    let mut options = AdapterOpenOptions {
        baud_rate: args.baud,
        eth_host: args.host.clone(),
        eth_port: args.eth_port,
        ..AdapterOpenOptions::default()
    };
    if args.host.is_some() || args.eth_port.is_some() {
        options.eth_protocol = Some(commwatch::io::EthProtocol::Udp);
    }

    let path = match device_type {
        DeviceType::Uart => args.port.clone(),
        DeviceType::Can => args.iface.clone(),
        _ => None,
    };

    let device = if args.simulate || path.is_none() && !matches!(device_type, DeviceType::Ethernet)
    {
        DeviceInfo::simulator(device_type)
    } else {
        DeviceInfo::new(
            path.as_deref().unwrap_or("endpoint"),
            device_type,
            path.clone(),
        )
    };

    (device, options)
}

/// Connect the pipeline per the CLI flags.
async fn connect(pipeline: &SessionPipeline, args: &TransportArgs) -> Result<(), String> {
    pipeline
        .set_protocol(&args.decoder)
        .map_err(|e| e.to_string())?;

    let device_type: DeviceType = args.proto.into();
    let adapter = adapter_for(device_type);
    let (device, options) = resolve_device(args);

    if device.is_simulator() {
        // Synthesized traffic for the frame-based transports, loopback for
        // the request/response ones
        let config = match device_type {
            DeviceType::Uart | DeviceType::Can => SimulatorConfig::burst(1, 100),
            _ => SimulatorConfig {
                mode: SimMode::Loopback,
                ..SimulatorConfig::default()
            },
        };
        pipeline
            .connect_simulator(adapter.as_ref(), &config)
            .await
            .map_err(|e| e.to_string())
    } else {
        pipeline
            .connect(adapter.as_ref(), &device, &options)
            .await
            .map_err(|e| e.to_string())
    }
}

async fn run_record(
    transport: TransportArgs,
    output: PathBuf,
    duration: u64,
) -> Result<(), String> {
    let pipeline = SessionPipeline::new();
    connect(&pipeline, &transport).await?;
    tlog!("[cli] recording for {}s...", duration);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
        _ = tokio::signal::ctrl_c() => {
            tlog!("[cli] interrupted");
        }
    }

    pipeline.disconnect().await.map_err(|e| e.to_string())?;

    let frames = pipeline.frames();
    let json = export::export_json(&frames);
    std::fs::write(&output, json).map_err(|e| format!("write {}: {}", output.display(), e))?;
    tlog!("[cli] wrote {} frames to {}", frames.len(), output.display());
    Ok(())
}

async fn run_replay(transport: TransportArgs, input: PathBuf, speed: f64) -> Result<(), String> {
    let text =
        std::fs::read_to_string(&input).map_err(|e| format!("read {}: {}", input.display(), e))?;
    let frames = export::import_json(&text).map_err(|e| e.to_string())?;

    let outbound: Vec<_> = frames
        .iter()
        .filter(|f| f.direction == Direction::Tx)
        .collect();
    if outbound.is_empty() {
        return Err("log contains no tx frames to replay".to_string());
    }

    let pipeline = SessionPipeline::new();
    connect(&pipeline, &transport).await?;
    tlog!(
        "[cli] replaying {} tx frames (speed x{})",
        outbound.len(),
        speed
    );

    let mut previous_ts: Option<u64> = None;
    for frame in outbound {
        if let Some(prev) = previous_ts {
            let gap_ns = frame.timestamp_ns.saturating_sub(prev);
            let scaled = (gap_ns as f64 / speed.max(0.001)) as u64;
            if scaled > 0 {
                tokio::time::sleep(Duration::from_nanos(scaled)).await;
            }
        }
        previous_ts = Some(frame.timestamp_ns);
        pipeline.send(&frame.raw).await.map_err(|e| e.to_string())?;
    }

    pipeline.disconnect().await.map_err(|e| e.to_string())?;
    tlog!("[cli] replay complete");
    Ok(())
}

async fn run_monitor(transport: TransportArgs) -> Result<(), String> {
    let pipeline = SessionPipeline::new();
    pipeline.bus().subscribe(
        EventKind::FrameReceived,
        Box::new(|event| {
            if let Event::FrameReceived(frame) = event {
                let status = match &frame.error {
                    Some(error) => error.code.clone(),
                    None => "ok".to_string(),
                };
                println!(
                    "{:>6} {:>16} {} [{}] {}",
                    frame.id,
                    frame.timestamp_ns / 1_000,
                    frame.direction.as_str(),
                    status,
                    format_hex(&frame.raw)
                );
            }
        }),
    );

    connect(&pipeline, &transport).await?;
    tlog!("[cli] monitoring; ctrl-c to stop");

    let mut stats_tick = tokio::time::interval(Duration::from_secs(10));
    stats_tick.tick().await; // First tick fires immediately
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats_tick.tick() => {
                if let Some(stats) = pipeline.stats() {
                    tlog!(
                        "[cli] rx {} msgs / {} B, tx {} msgs / {} B, {} errors",
                        stats.messages_rx, stats.bytes_rx,
                        stats.messages_tx, stats.bytes_tx, stats.errors
                    );
                }
                pipeline.publish_stats();
            }
        }
    }

    pipeline.disconnect().await.map_err(|e| e.to_string())?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(dir) = cli.log_dir.as_deref() {
        if let Err(e) = commwatch::logging::enable_file_log(dir) {
            eprintln!("error: cannot log to {}: {}", dir.display(), e);
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Command::Record {
            transport,
            output,
            duration,
        } => run_record(transport, output, duration).await,
        Command::Replay {
            transport,
            input,
            speed,
        } => run_replay(transport, input, speed).await,
        Command::Monitor { transport } => run_monitor(transport).await,
    };

    commwatch::logging::disable_file_log();

    if let Err(message) = result {
        eprintln!("error: {}", message);
        std::process::exit(1);
    }
}
