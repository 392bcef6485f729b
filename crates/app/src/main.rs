use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ledwall_core::{
    AddressingTable, AppConfig, AudioPump, Engine, LedWallError, Program, ScanAxis, SceneKind,
    StartX, StartY, TestTone, Transport, UdpTransport, WiringConfig,
};
use tracing_subscriber::EnvFilter;

const TEST_TONE_BPM: f32 = 120.0;

fn main() -> ledwall_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, seconds } => run(&config, seconds),
        Commands::Addressing(args) => print_addressing(&args),
        Commands::CheckProgram { path, preset } => check_program(path.as_ref(), preset.as_deref()),
        Commands::DefaultConfig => {
            println!("{}", AppConfig::live_defaults().to_json()?);
            Ok(())
        }
    }
}

fn run(path: &PathBuf, seconds: Option<u64>) -> ledwall_core::Result<()> {
    let config = AppConfig::load(path)?;
    tracing::info!(?path, devices = config.devices.len(), "starting renderer");

    let engine = Engine::start(&config, |device| {
        let transport = UdpTransport::connect(&device.target)?;
        Ok(Box::new(transport) as Box<dyn Transport>)
    })?;
    let mut audio = AudioPump::start(
        TestTone::new(config.audio.sample_rate, TEST_TONE_BPM),
        &config.audio,
        Arc::clone(engine.inputs()),
    )?;

    match seconds {
        Some(seconds) => std::thread::sleep(Duration::from_secs(seconds)),
        None => loop {
            std::thread::sleep(Duration::from_secs(60));
            if !engine.is_running() {
                tracing::error!("render thread exited");
                break;
            }
        },
    }

    audio.stop();
    for name in engine.device_names() {
        if let Some(stats) = engine.device_stats(name) {
            tracing::info!(
                device = name,
                transmitted = stats.transmitted,
                dropped = stats.dropped_busy,
                errors = stats.transport_errors,
                "device summary"
            );
        }
    }
    let frames = engine.shutdown();
    tracing::info!(frames, "renderer stopped");
    Ok(())
}

fn print_addressing(args: &AddressingArgs) -> ledwall_core::Result<()> {
    let wiring = WiringConfig {
        serpentine: args.serpentine,
        axis: if args.vertical {
            ScanAxis::Vertical
        } else {
            ScanAxis::Horizontal
        },
        start_x: if args.start_right {
            StartX::Right
        } else {
            StartX::Left
        },
        start_y: if args.start_top {
            StartY::Top
        } else {
            StartY::Bottom
        },
    };
    let table = AddressingTable::generate(args.width, args.height, &wiring)?;

    // top row first, as the panel is seen from the front
    let digits = (table.len().saturating_sub(1)).to_string().len();
    for y in (0..table.height()).rev() {
        let row: Vec<String> = (0..table.width())
            .filter_map(|x| table.channel(x, y))
            .map(|channel| format!("{channel:>digits$}"))
            .collect();
        println!("{}", row.join(" "));
    }
    Ok(())
}

fn check_program(path: Option<&PathBuf>, preset: Option<&str>) -> ledwall_core::Result<()> {
    let (label, source) = match (path, preset) {
        (Some(path), None) => (path.display().to_string(), std::fs::read_to_string(path)?),
        (None, Some(name)) => {
            let kind = SceneKind::from_name(name)
                .ok_or_else(|| LedWallError::msg(format!("unknown preset `{name}`")))?;
            (format!("preset {name}"), kind.source().to_string())
        }
        _ => return Err(LedWallError::msg("pass either a program path or --preset")),
    };

    match Program::compile(&source) {
        Ok(program) => {
            println!("{label}: ok ({} locals)", program.slot_count());
            Ok(())
        }
        Err(LedWallError::ProgramBuild { position, message }) => {
            let (line, column) = line_column(&source, position);
            Err(LedWallError::msg(format!(
                "{label}:{line}:{column}: {message}"
            )))
        }
        Err(err) => Err(err),
    }
}

fn line_column(source: &str, position: usize) -> (usize, usize) {
    let mut end = position.min(source.len());
    while !source.is_char_boundary(end) {
        end -= 1;
    }
    let before = &source[..end];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |tail| tail.chars().count()) + 1;
    (line, column)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Canvas renderer driving LED panels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the renderer and every configured device.
    Run {
        /// Path to a JSON configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Stop after this many seconds instead of running until killed.
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Print a panel's addressing table, top row first.
    Addressing(AddressingArgs),
    /// Compile an image program and report build errors.
    CheckProgram {
        /// Program file to compile.
        #[arg(conflicts_with = "preset")]
        path: Option<PathBuf>,
        /// Built-in preset to compile instead of a file.
        #[arg(long)]
        preset: Option<String>,
    },
    /// Print the default configuration as JSON.
    DefaultConfig,
}

#[derive(Args, Debug)]
struct AddressingArgs {
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    /// Alternate direction on every other line.
    #[arg(long)]
    serpentine: bool,
    /// Wire along columns instead of rows.
    #[arg(long)]
    vertical: bool,
    #[arg(long)]
    start_right: bool,
    #[arg(long)]
    start_top: bool,
}
