use crate::config::DEFAULT_CONFIG_FILE;
use crate::state::DEFAULT_STATE_FILE;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "printhub-agent",
    version,
    about = "Printer telemetry and remote control agent"
)]
pub struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[arg(long, default_value = DEFAULT_STATE_FILE)]
    pub state: PathBuf,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub log_to_stderr: bool,
}
