use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use structopt::StructOpt;

use eps::{app, Config, Result};

fn main() -> Result<()> {
    Config::dotenv();
    let config = Config::from_args();
    config.setup_logger();

    let shutdown = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    }

    app::run(config, shutdown)
}
