use std::{env, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use log::{debug, warn};

use shadowfs::{
    batch::{Batch, BatchReport},
    config::{log_level, Config, LOG_ENV},
    engine::DockerCli,
};

/// shadowctl
#[derive(Debug, Parser)]
#[clap(name = "shadowctl", version)]
pub struct App {
    /// Configuration file (default: $SHADOWFS_CONFIG, then /etc/shadowfs/config.toml)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Args)]
struct Images {
    /// Images to process, separated by commas
    #[clap(long, short, value_delimiter = ',', required = true)]
    images: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Shadow images and start recording the files they use
    Shadow {
        #[clap(flatten)]
        images: Images,
        /// The filtering-mount executable
        #[clap(long)]
        debloatedfs: Option<PathBuf>,
    },
    /// Rebuild shadowed images from the files they used and load them back
    Debloat {
        #[clap(flatten)]
        images: Images,
        /// Only rebuild the top N layers; -1 rebuilds all of them
        #[clap(long, short, default_value_t = -1, allow_negative_numbers = true)]
        top: i64,
    },
    /// Point shadowed images back at their original layers
    Restore {
        #[clap(flatten)]
        images: Images,
    },
    /// Restart filtering mounts of shadowed images, e.g. after a reboot
    Remount {
        #[clap(flatten)]
        images: Images,
        /// The filtering-mount executable
        #[clap(long)]
        debloatedfs: Option<PathBuf>,
    },
    /// Show whether images are shadowed and how much they used so far
    Status {
        #[clap(flatten)]
        images: Images,
    },
}

fn finish(report: &BatchReport) -> ExitCode {
    print!("{report}");
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::new()
        .filter_level(log_level(env::var(LOG_ENV).ok().as_deref()))
        .init();

    let args = App::parse();
    let Some(cmd) = args.cmd else {
        App::command().print_help()?;
        return Ok(ExitCode::FAILURE);
    };

    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if let Command::Shadow {
        debloatedfs: Some(path),
        ..
    }
    | Command::Remount {
        debloatedfs: Some(path),
        ..
    } = &cmd
    {
        config.debloated_fs = path.clone();
    }
    debug!("{config:?}");

    if !rustix::process::getuid().is_root() {
        warn!("not running as root; engine storage is usually not writable");
    }

    let engine = DockerCli::from_config(&config);
    let batch = Batch::new(&engine, &config).context("locating engine storage")?;

    let report = match cmd {
        Command::Shadow { images, .. } => batch.shadow(&images.images)?,
        Command::Debloat { images, top } => {
            let top = usize::try_from(top).ok();
            batch.debloat(&images.images, top)?
        }
        Command::Restore { images } => batch.restore(&images.images)?,
        Command::Remount { images, .. } => batch.remount(&images.images)?,
        Command::Status { images } => {
            let (statuses, report) = batch.status(&images.images);
            for status in statuses {
                println!("{status}");
            }
            for (image, err) in &report.failed {
                eprintln!("{image}: {err}");
            }
            return Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
    };

    Ok(finish(&report))
}
