//! Polls selected Modbus holding registers of one device and logs their
//! decoded values.

use anyhow::Result;
use clap::Parser;
use regwatch::Args;

#[tokio::main]
async fn main() -> Result<()> {
    regwatch::run(Args::parse()).await
}
