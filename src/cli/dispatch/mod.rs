//! Map validated CLI arguments to an action.
//!
//! clap has already type-checked every value; this builds the [`Config`] and
//! runs the checks clap cannot express.

use crate::{
    cli::{
        actions::{server::Args, Action},
        commands::{self, auth, broker, storage},
    },
    config::Config,
};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// # Errors
/// Returns an error if a required argument is missing or a value is unusable.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches
        .get_one::<u16>(commands::ARG_PORT)
        .copied()
        .unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(commands::ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    let broker_opts = broker::Options::parse(matches)?;
    let auth_opts = auth::Options::parse(matches);

    let config = Config::new(SecretString::from(dsn), SecretString::from(broker_opts.url))
        .with_port(port)
        .with_message_ttl_ms(broker_opts.message_ttl_ms)
        .with_verifier_workers(broker_opts.verifier_workers)
        .with_login_timeout(auth_opts.login_timeout)
        .with_frontend_origin(auth_opts.frontend_origin)
        .with_object_store(storage::Options::parse(matches))
        .validate()
        .context("invalid configuration")?;

    Ok(Action::Server(Args { config }))
}
