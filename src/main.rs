mod cli;
mod logger;

use std::process::ExitCode;

use clap::Parser;
use layercache::CacheSettings;

fn main() -> ExitCode {
    let args = cli::CliArgs::parse();

    // Session log (overwrites the previous session's log)
    logger::init(args.verbose);
    if args.verbose
        && let Some(path) = logger::log_path()
    {
        println!("log: {}", path.display());
    }

    let mut settings = CacheSettings::load();
    if let Some(mb) = args.memory_mb {
        settings.memory_budget_mb = mb.max(1);
    }
    let config = settings.to_config();
    log::info!(
        "Cache budget {} MB ({} tiles), spill dir {:?}",
        settings.memory_budget_mb,
        config.max_resident_images,
        config.base_path
    );

    let code = cli::run(&args, &config);

    // A per-session scratch directory is ours to remove.
    if settings.scratch_dir.is_none()
        && let Some(dir) = &config.base_path
        && let Err(e) = std::fs::remove_dir_all(dir)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        log::warn!("Could not remove scratch dir {}: {}", dir.display(), e);
    }
    code
}
