use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use psmrescorer::{PsmRescorer, PsmRescorerError};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<(), PsmRescorerError> {
    let args = PsmRescorer::parse();
    let config_file = args.config_file.clone();

    let mut config = Figment::from(Serialized::defaults(args)).merge(Toml::file("psmrescorer.toml"));
    if let Some(path) = config_file {
        config = config.merge(Toml::file_exact(path));
    }
    config = config.merge(Env::prefixed("PSMRESCORER_"));

    let driver: PsmRescorer = config.extract().map_err(Box::new)?;
    let _guard = driver.init_logging()?;
    driver.main()?;
    Ok(())
}
