use crate::acquire::MeterTarget;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fronius-smartmeter")]
#[command(about = "Publishes Fronius Smart Meter readings as a grid meter service", long_about = None)]
pub struct Args {
    /// Meter address, or "test" for the canned payload. Discovered when omitted.
    #[arg(long)]
    pub ip: Option<MeterTarget>,

    /// YAML configuration file. Built-in defaults apply when it does not exist.
    #[arg(long, env = "APP_CONFIG", default_value = "config/config.yaml")]
    pub config: PathBuf,
}
