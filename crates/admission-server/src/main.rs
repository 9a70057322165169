use admission_server::settings::ServerSettings;
use admission_server::{cli, run, setup_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli::build_cli().get_matches();
    let server_settings = ServerSettings::from_args(&matches)?;

    setup_tracing(&server_settings.log_level, &server_settings.log_format)?;

    run(server_settings).await
}
