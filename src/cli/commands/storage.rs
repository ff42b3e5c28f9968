use crate::config::ObjectStoreConfig;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_OBJECT_STORE_URL: &str = "object-store-url";
pub const ARG_OBJECT_STORE_BUCKET: &str = "object-store-bucket";
pub const ARG_OBJECT_STORE_REGION: &str = "object-store-region";
pub const ARG_OBJECT_STORE_ACCESS_KEY: &str = "object-store-access-key";
pub const ARG_OBJECT_STORE_SECRET_KEY: &str = "object-store-secret-key";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_OBJECT_STORE_URL)
                .long(ARG_OBJECT_STORE_URL)
                .help("S3-compatible endpoint that receives uploads")
                .env("REGISTRAR_OBJECT_STORE_URL")
                .default_value("http://localhost:9000"),
        )
        .arg(
            Arg::new(ARG_OBJECT_STORE_BUCKET)
                .long(ARG_OBJECT_STORE_BUCKET)
                .help("Bucket that holds user photos and documents")
                .env("REGISTRAR_OBJECT_STORE_BUCKET")
                .default_value("user-files"),
        )
        .arg(
            Arg::new(ARG_OBJECT_STORE_REGION)
                .long(ARG_OBJECT_STORE_REGION)
                .help("Region sent to the object store")
                .env("REGISTRAR_OBJECT_STORE_REGION")
                .default_value("us-east-1"),
        )
        .arg(
            Arg::new(ARG_OBJECT_STORE_ACCESS_KEY)
                .long(ARG_OBJECT_STORE_ACCESS_KEY)
                .help("Access key id; defaults to the AWS credential chain")
                .env("REGISTRAR_OBJECT_STORE_ACCESS_KEY")
                .requires(ARG_OBJECT_STORE_SECRET_KEY),
        )
        .arg(
            Arg::new(ARG_OBJECT_STORE_SECRET_KEY)
                .long(ARG_OBJECT_STORE_SECRET_KEY)
                .help("Secret access key")
                .env("REGISTRAR_OBJECT_STORE_SECRET_KEY")
                .hide_env_values(true)
                .requires(ARG_OBJECT_STORE_ACCESS_KEY),
        )
}

pub struct Options;

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> ObjectStoreConfig {
        let defaults = ObjectStoreConfig::default();
        ObjectStoreConfig {
            url: matches
                .get_one::<String>(ARG_OBJECT_STORE_URL)
                .cloned()
                .unwrap_or(defaults.url),
            bucket: matches
                .get_one::<String>(ARG_OBJECT_STORE_BUCKET)
                .cloned()
                .unwrap_or(defaults.bucket),
            region: matches
                .get_one::<String>(ARG_OBJECT_STORE_REGION)
                .cloned()
                .unwrap_or(defaults.region),
            access_key_id: matches.get_one::<String>(ARG_OBJECT_STORE_ACCESS_KEY).cloned(),
            secret_access_key: matches
                .get_one::<String>(ARG_OBJECT_STORE_SECRET_KEY)
                .map(|secret| SecretString::from(secret.clone())),
        }
    }
}
