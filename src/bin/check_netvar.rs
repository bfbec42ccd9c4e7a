use clap::Parser;
use netshrvar::{
    config::NetVarConfig,
    services::{LoopbackService, NetVarService},
};
use tracing::{error, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

/// Report whether a network variable path exists
#[derive(Parser)]
struct Options {
    /// Variable or folder path, e.g. \\localhost\lib\var
    #[clap(required = true, id = "PATH")]
    path: String,
    /// Configuration file declaring the variables to browse
    #[clap(long)]
    config: Option<String>,
    /// Section of the configuration file
    #[clap(long, requires = "config", default_value = "main")]
    section: String,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let opts = Options::parse();

    // RUST_LOG directives refine the level picked by -v
    let filter = EnvFilter::builder()
        .with_default_directive(
            match opts.verbose {
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                2.. => LevelFilter::TRACE,
            }
            .into(),
        )
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let service = LoopbackService::new();
    if let Some(config_file) = &opts.config {
        match NetVarConfig::load(config_file) {
            Ok(config) => {
                for param in config.params(&opts.section) {
                    service.define(&param.netvar);
                }
            }
            Err(e) => error!("Unable to load '{config_file}': {e}"),
        }
    }

    match service.path_exists(&opts.path) {
        Ok(true) => println!("{} exists", opts.path),
        Ok(false) => println!("{} does NOT exist", opts.path),
        Err(e) => {
            error!("Unable to browse '{}': {e}", opts.path);
            println!("{} does NOT exist", opts.path);
        }
    }
}
