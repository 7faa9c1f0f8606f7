use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Tail the logs of docker containers, tag every line with labels and
/// print it, remembering how far each container was read.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// TOML file listing containers, relabel rules and where positions
    /// are kept.
    #[arg(short, long, value_name = "FILE", default_value = "docker-target.toml")]
    pub config: PathBuf,
}

static ARGS: OnceLock<Args> = OnceLock::new();

/// Arguments of this process, parsed on first use.
pub fn args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
