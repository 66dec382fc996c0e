//! Command line surface

use crate::logging::LogFormat;
use anyhow::Context;
use autoswitch_core::SwitchConfig;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;

/// Which reference workload the worker runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Workload {
    /// Answer every TCP connection with the worker's version
    Serve { port: u16 },
    /// Fail the entry point, optionally after a delay
    Throw { after: Duration },
    /// Never report listening
    Stall,
}

/// Parsed invocation
#[derive(Debug, Clone)]
pub(crate) struct Options {
    pub(crate) version_file: PathBuf,
    pub(crate) config_file: Option<PathBuf>,
    pub(crate) slots: Option<usize>,
    pub(crate) grace_ms: Option<u64>,
    pub(crate) host_delegated: bool,
    pub(crate) control_endpoint: Option<String>,
    pub(crate) log_format: LogFormat,
    pub(crate) workload: Workload,
}

pub(crate) fn command() -> Command {
    Command::new("autoswitch")
        .version(autoswitch_core::VERSION)
        .about("Run a reference workload with zero-downtime version switching")
        .subcommand_required(true)
        .arg(
            Arg::new("version-file")
                .long("version-file")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("File holding the expected version"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("slots")
                .long("slots")
                .value_parser(value_parser!(usize))
                .help("Number of serving workers"),
        )
        .arg(
            Arg::new("grace-ms")
                .long("grace-ms")
                .value_parser(value_parser!(u64))
                .help("Milliseconds between shutdown and force-kill"),
        )
        .arg(
            Arg::new("host-delegated")
                .long("host-delegated")
                .action(ArgAction::SetTrue)
                .help("Let an external host manager recycle this process"),
        )
        .arg(
            Arg::new("control-endpoint")
                .long("control-endpoint")
                .help("Host manager control endpoint (address or socket path)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .default_value("pretty")
                .value_parser(["pretty", "json"])
                .help("Log output format"),
        )
        .subcommand(
            Command::new("serve")
                .about("Answer each TCP connection with the running version")
                .arg(
                    Arg::new("port")
                        .long("port")
                        .required(true)
                        .value_parser(value_parser!(u16))
                        .help("Port shared by all workers"),
                ),
        )
        .subcommand(
            Command::new("throw")
                .about("Fail the workload entry point")
                .arg(
                    Arg::new("after-ms")
                        .long("after-ms")
                        .default_value("0")
                        .value_parser(value_parser!(u64))
                        .help("Delay before failing"),
                ),
        )
        .subcommand(Command::new("stall").about("Start but never report listening"))
}

impl Options {
    pub(crate) fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let workload = match matches.subcommand() {
            Some(("serve", args)) => Workload::Serve {
                port: *args.get_one::<u16>("port").context("missing --port")?,
            },
            Some(("throw", args)) => Workload::Throw {
                after: Duration::from_millis(args.get_one::<u64>("after-ms").copied().unwrap_or(0)),
            },
            Some(("stall", _)) => Workload::Stall,
            Some((other, _)) => anyhow::bail!("unknown workload: {other}"),
            None => anyhow::bail!("no workload given"),
        };

        let log_format = matches
            .get_one::<String>("log-format")
            .map(|s| s.parse::<LogFormat>())
            .transpose()
            .map_err(anyhow::Error::msg)?
            .unwrap_or_default();

        Ok(Self {
            version_file: matches
                .get_one::<PathBuf>("version-file")
                .cloned()
                .context("missing --version-file")?,
            config_file: matches.get_one::<PathBuf>("config").cloned(),
            slots: matches.get_one::<usize>("slots").copied(),
            grace_ms: matches.get_one::<u64>("grace-ms").copied(),
            host_delegated: matches.get_flag("host-delegated"),
            control_endpoint: matches.get_one::<String>("control-endpoint").cloned(),
            log_format,
            workload,
        })
    }

    /// Config file first, then command line overrides
    pub(crate) fn switch_config(&self) -> anyhow::Result<SwitchConfig> {
        let mut config = match &self.config_file {
            Some(path) => SwitchConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SwitchConfig::new(),
        };

        if let Some(slots) = self.slots {
            config = config.with_slots(slots);
        }
        if let Some(grace_ms) = self.grace_ms {
            config = config.with_grace_period(Duration::from_millis(grace_ms));
        }
        if self.host_delegated {
            config = config.with_host_delegated(true);
        }
        if let Some(endpoint) = &self.control_endpoint {
            config = config.with_control_endpoint(endpoint.clone());
        }

        config.validate()?;
        Ok(config)
    }
}
