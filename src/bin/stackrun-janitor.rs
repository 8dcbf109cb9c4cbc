//! Instance janitor for stackrun.
//!
//! Terminates every running batch instance tagged with a job name. Useful
//! after a session was killed before it could tear down its own machines.

use std::io::Write as _;

use clap::Parser;
use stackrun::{BatchConfig, BatchProvisioner, EucaClient, ProcessCommandRunner};

#[derive(Debug, Parser)]
#[command(
    name = "stackrun-janitor",
    about = "Terminate batch instances left behind by a job"
)]
struct Cli {
    /// Job name the instances were tagged with.
    job_name: String,
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let config = BatchConfig::load_without_cli_args().map_err(|err| err.to_string())?;
    config.validate().map_err(|err| err.to_string())?;
    if !config.has_credentials() {
        return Err(format!(
            "no batch credentials found: set {} before running the janitor",
            config.credentials_env
        ));
    }

    let api = EucaClient::new(ProcessCommandRunner).with_bin_prefix(config.bin_prefix.as_str());
    let provisioner = BatchProvisioner::new(api, config.template());
    let destroyed = provisioner
        .destroy_instances(&cli.job_name)
        .map_err(|err| err.to_string())?;
    writeln!(
        std::io::stdout(),
        "janitor sweep complete: job={}, terminated_instances={destroyed}",
        cli.job_name
    )
    .map_err(|err| err.to_string())?;
    Ok(())
}
