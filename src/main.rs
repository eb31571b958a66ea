use std::io::Write;
use std::process;

use clap::Parser;
use log::warn;

use relayc::cli::{parse_shape_dict, Cli};
use relayc::driver;
use relayc::loader::Framework;

fn main_entry() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // The tag is validated before any file is touched.
    let framework: Framework = cli.framework.parse()?;
    let shape_dict = cli
        .shape_dict
        .as_deref()
        .map(parse_shape_dict)
        .transpose()?;
    driver::run(
        framework,
        &cli.model_path,
        shape_dict.as_ref(),
        &cli.output,
    )?;
    Ok(())
}

fn main() {
    env_logger::init();
    let interrupt = ctrlc::set_handler(|| {
        // Keep the shell prompt on its own line.
        let _ = std::io::stdout().write_all(b"\n");
        process::exit(1);
    });
    if let Err(e) = interrupt {
        warn!("could not install interrupt handler: {e}");
    }

    if let Err(e) = main_entry() {
        eprintln!("relayc: {e}");
        process::exit(1);
    }
}
