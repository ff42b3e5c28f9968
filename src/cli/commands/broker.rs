use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};

pub const ARG_BROKER_URL: &str = "broker-url";
pub const ARG_MESSAGE_TTL_MS: &str = "message-ttl-ms";
pub const ARG_VERIFIER_WORKERS: &str = "verifier-workers";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BROKER_URL)
                .short('b')
                .long(ARG_BROKER_URL)
                .help("Message broker URL")
                .long_help(
                    "Message broker URL. amqp:// and amqps:// connect to RabbitMQ; memory:// runs an in-process broker for local development.",
                )
                .env("REGISTRAR_BROKER_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_MESSAGE_TTL_MS)
                .long(ARG_MESSAGE_TTL_MS)
                .help("Per-message TTL on primary queues in milliseconds, 0 disables expiry")
                .env("REGISTRAR_MESSAGE_TTL_MS")
                .default_value("60000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_VERIFIER_WORKERS)
                .long(ARG_VERIFIER_WORKERS)
                .help("Login verification consumers to run in this process, 0 disables them")
                .env("REGISTRAR_VERIFIER_WORKERS")
                .default_value("1")
                .value_parser(clap::value_parser!(usize)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub url: String,
    pub message_ttl_ms: u64,
    pub verifier_workers: usize,
}

impl Options {
    /// # Errors
    /// Returns an error if the broker URL is missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            url: matches
                .get_one::<String>(ARG_BROKER_URL)
                .cloned()
                .context("missing required argument: --broker-url")?,
            message_ttl_ms: matches
                .get_one::<u64>(ARG_MESSAGE_TTL_MS)
                .copied()
                .unwrap_or(60_000),
            verifier_workers: matches
                .get_one::<usize>(ARG_VERIFIER_WORKERS)
                .copied()
                .unwrap_or(1),
        })
    }
}
