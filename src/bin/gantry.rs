// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use clap::App;
use tokio::io::BufReader;
use tokio::runtime;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gantry::config::{self, Topology};
use gantry::log::LogArtifact;
use gantry::supervisor::Supervisor;

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
}

impl<'a, 'b> SetupClapApp for App<'a, 'b> {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }
}

fn main() {
    let args = App::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .args(&config::args())
        .get_matches();

    let topology = match Topology::from_matches(&args) {
        Ok(topology) => topology,
        Err(e) => {
            eprintln!("{}", e);
            println!("{}", args.usage());
            std::process::exit(2);
        }
    };
    let lenient = args.is_present(config::LENIENT_EXIT);

    let (log, log_error) = match LogArtifact::create(&topology.log_file) {
        Ok(log) => (log, None),
        Err(e) => (LogArtifact::detached(&topology.log_file), Some(e)),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log.clone())
        .with_ansi(false)
        .init();

    if let Some(e) = log_error {
        error!("workers will run without a log file: {}", e);
    }
    info!(pid = %std::process::id(), ?topology, "supervisor starting");

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to initialize Tokio Runtime");

    let mut supervisor = Supervisor::provision(topology, log);
    let outcome = runtime.block_on(supervisor.run(BufReader::new(tokio::io::stdin())));

    // stdin is read on a blocking thread that would keep the runtime from dropping
    runtime.shutdown_background();

    let code = match outcome {
        Ok(outcome) => {
            info!(?outcome, "supervisor stopped");
            outcome.exit_code()
        }
        Err(e) => {
            error!("supervisor failed: {}", e);
            eprintln!("{}", e);
            1
        }
    };

    std::process::exit(if lenient { 0 } else { code });
}
