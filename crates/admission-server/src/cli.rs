use clap::{Arg, Command};

pub fn build_cli() -> Command {
    Command::new("admission-server")
        .about("Admission controller validating container image signatures")
        .arg(
            Arg::new("addr")
                .long("addr")
                .default_value("0.0.0.0:5000")
                .help("Bind address and port of the HTTPS server"),
        )
        .arg(
            Arg::new("cert-file")
                .long("cert-file")
                .default_value("/app/certs/tls.crt")
                .help("Path to the TLS certificate"),
        )
        .arg(
            Arg::new("key-file")
                .long("key-file")
                .default_value("/app/certs/tls.key")
                .help("Path to the TLS key"),
        )
        .arg(
            Arg::new("config-dir")
                .long("config-dir")
                .default_value("/app/config")
                .help("Directory holding the main configuration file"),
        )
        .arg(
            Arg::new("secrets-dir")
                .long("secrets-dir")
                .default_value("/app/secrets")
                .help("Directory holding mounted registry secrets"),
        )
        .arg(
            Arg::new("alert-template-dir")
                .long("alert-template-dir")
                .default_value("/app/alerts/templates")
                .help("Directory holding notification templates"),
        )
        .arg(
            Arg::new("redis-cert-dir")
                .long("redis-cert-dir")
                .default_value("/app/redis-certs")
                .help("Directory holding the cache TLS certificate"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .env("LOG_LEVEL")
                .default_value("info")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .env("LOG_FORMAT")
                .default_value("text")
                .help("Log message format (text, json)"),
        )
}
