//! Vela compositor entry point.
//!
//! Starts the core in a headless session: one virtual output, the null
//! renderer, and the event spine running until shutdown. Display and input
//! backends attach through the library API; this binary is what the rest
//! of the desktop boots and supervises.

use std::env;
use std::path::PathBuf;
use std::process::exit;
use tracing_subscriber::EnvFilter;
use vela_compositor::config::CompositorConfig;
use vela_compositor::geometry::Size;
use vela_compositor::output::Mode;
use vela_compositor::spine::EventSpine;
use vela_compositor::state::DesktopState;
use vela_compositor::{NAME, VERSION};

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                return;
            }
            "--version" | "-v" => {
                println!("{NAME} {VERSION}");
                return;
            }
            "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = Some(PathBuf::from(path)),
                    None => {
                        eprintln!("--config requires a path");
                        exit(1);
                    }
                }
            }
            arg => {
                eprintln!("Unknown option: {arg}");
                eprintln!("Use --help for usage information");
                exit(1);
            }
        }
        i += 1;
    }

    if let Err(err) = run(config_path) {
        eprintln!("{NAME}: {err:#}");
        exit(1);
    }
}

fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = match &config_path {
        Some(path) => CompositorConfig::load_from_file(path)?,
        None => CompositorConfig::load()?,
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.general.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(version = VERSION, "starting {NAME}");

    let mut spine = EventSpine::new()?;
    let mut state = DesktopState::new(config, spine.handle());

    // Headless session: a virtual 1080p head stands in until a display
    // backend attaches real outputs.
    state.add_output(
        "VIRT-1",
        "virtual output",
        Size::new(520, 290),
        vec![Mode {
            size: Size::new(1920, 1080),
            refresh_mhz: 60_000,
            preferred: true,
        }],
    );
    tracing::info!(
        outputs = state.outputs.ids().len(),
        renderer = state.renderer.name(),
        seat = %state.input.seat.name,
        "session ready"
    );

    spine.run_until_shutdown(&mut state)
}

fn print_help() {
    println!("{NAME} - Wayland compositor core for the Vela desktop");
    println!();
    println!("Usage: {NAME} [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --help, -h           Show this help message");
    println!("  --version, -v        Show version information");
    println!("  --config <path>      Load configuration from a specific file");
    println!();
    println!("Environment Variables:");
    println!("  RUST_LOG             Override the configured log filter");
}
