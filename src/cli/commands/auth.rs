use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

pub const ARG_LOGIN_TIMEOUT_SECONDS: &str = "login-timeout-seconds";
pub const ARG_FRONTEND_ORIGIN: &str = "frontend-origin";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOGIN_TIMEOUT_SECONDS)
                .long(ARG_LOGIN_TIMEOUT_SECONDS)
                .help("How long a login request waits for its verification reply")
                .env("REGISTRAR_LOGIN_TIMEOUT_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_FRONTEND_ORIGIN)
                .long(ARG_FRONTEND_ORIGIN)
                .help("Frontend origin allowed by CORS")
                .env("REGISTRAR_FRONTEND_ORIGIN")
                .default_value("http://localhost:3000"),
        )
}

#[derive(Debug)]
pub struct Options {
    pub login_timeout: Duration,
    pub frontend_origin: String,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            login_timeout: Duration::from_secs(
                matches
                    .get_one::<u64>(ARG_LOGIN_TIMEOUT_SECONDS)
                    .copied()
                    .unwrap_or(5),
            ),
            frontend_origin: matches
                .get_one::<String>(ARG_FRONTEND_ORIGIN)
                .cloned()
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
        }
    }
}
