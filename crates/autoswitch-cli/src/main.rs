//! `autoswitch` binary
//!
//! The same executable is the supervisor and every worker: the supervisor
//! re-executes it with identical arguments, and bootstrap picks the role
//! from the environment.

mod cli;
mod logging;
mod workload;

use autoswitch_core::{Environment, FileOracle, Service, ServiceExit, VersionOracle};
use cli::{Options, Workload};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli::command().get_matches();
    let options = match Options::from_matches(&matches) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(2);
        }
    };
    logging::init_logging(options.log_format);

    let config = match options.switch_config() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let oracle: Arc<dyn VersionOracle> = Arc::new(FileOracle::new(options.version_file.clone()));
    let env = Environment::capture();

    let exit: ServiceExit = match options.workload {
        Workload::Serve { port } => {
            Service::new(config, oracle, move |ctx| workload::serve(ctx, port))
                .run(&env)
                .await
        }
        Workload::Throw { after } => {
            Service::new(config, oracle, move |_ctx| workload::throw(after))
                .run(&env)
                .await
        }
        Workload::Stall => Service::new(config, oracle, workload::stall).run(&env).await,
    };

    exit.into()
}
