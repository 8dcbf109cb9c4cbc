//! Build script for the `stackrun` manual pages.
//!
//! Renders `stackrun.1` for the top-level command and one
//! `stackrun-<subcommand>.1` page per subcommand into the build output
//! directory, where the packaging step picks them up.

use std::env;
use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const PROGRAM: &str = "stackrun";

fn main() -> Result<(), Box<dyn Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = PathBuf::from(
        env::var_os("OUT_DIR")
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?,
    );

    let command = Cli::command();
    write_page(&out_dir, PROGRAM, Man::new(command.clone()))?;
    for subcommand in command.get_subcommands() {
        let page = format!("{PROGRAM}-{}", subcommand.get_name());
        let man = Man::new(subcommand.clone()).title(page.to_uppercase());
        write_page(&out_dir, &page, man)?;
    }
    Ok(())
}

fn write_page(out_dir: &Path, page: &str, man: Man) -> Result<(), Box<dyn Error>> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    fs::write(out_dir.join(format!("{page}.1")), buffer)?;
    Ok(())
}
