use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use nport_core::config::{self, RuntimeConfig};
use nport_core::flash::MemFlash;
use nport_core::store::ConfigStore;
use nport_core::uart::SimUart;
use nport_core::Runtime;

#[derive(Parser, Debug)]
#[clap(name = "nport-serverd", about = "16-port serial-to-network terminal server")]
struct Args {
    /// Path to the runtime configuration TOML file. Falls back to built-in
    /// defaults if omitted.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the simulated flash image; overrides the value from
    /// the config file.
    #[clap(long, parse(from_os_str), value_name = "DIR")]
    flash_dir: Option<PathBuf>,

    /// Print the resolved runtime configuration and exit without starting.
    #[clap(long)]
    print_config: bool,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => config::default_config(),
    };
    if let Some(dir) = &args.flash_dir {
        cfg.flash_dir = dir.to_string_lossy().to_string();
    }

    init_logging(&cfg, args.verbose);

    if args.print_config {
        println!("{}", toml::to_string_pretty(&cfg).context("failed to serialize config")?);
        return Ok(());
    }

    log::info!("nport-serverd starting, flash_dir={}", cfg.flash_dir);

    let store = build_store(&cfg).context("failed to initialize config store")?;
    let uart = Box::new(SimUart::new(nport_core::channel::NUM_PORTS));

    let runtime = Runtime::new(cfg, store);
    runtime.run(uart).context("runtime exited with an error")?;
    Ok(())
}

fn init_logging(cfg: &RuntimeConfig, verbose: u8) {
    let default_level = match verbose {
        0 => cfg.logging.default_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

/// Builds the device config store against a file-backed flash image under
/// `cfg.flash_dir`, creating the directory and a blank image on first run.
fn build_store(cfg: &RuntimeConfig) -> Result<ConfigStore> {
    std::fs::create_dir_all(&cfg.flash_dir)
        .with_context(|| format!("failed to create flash dir {}", cfg.flash_dir))?;
    let image_path = PathBuf::from(&cfg.flash_dir).join("flash.bin");
    let flash = MemFlash::open_file(&image_path, 0x200_0000)
        .with_context(|| format!("failed to open flash image {}", image_path.display()))?;
    ConfigStore::init(Box::new(flash)).context("failed to load device configuration")
}
