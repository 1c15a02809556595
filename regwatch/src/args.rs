//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Poll a Modbus device and decode its holding registers.
#[derive(Parser, Debug, Clone)]
#[command(name = "regwatch")]
#[command(about = "Polls selected Modbus holding registers and decodes them")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "regwatch.json5")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write a register after startup, as NAME=VALUE. May be repeated.
    #[arg(short, long = "write", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    pub writes: Vec<(String, String)>,

    /// Poll once, print the decoded values and exit.
    #[arg(long)]
    pub once: bool,
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing register name in '{}'", s));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
