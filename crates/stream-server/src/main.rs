use clap::Parser;
use configuration::cli::ConfigOverrides;

/// Standalone streaming server. `cargo run -p stream-server -- --bind 127.0.0.1:3000`
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut settings = configuration::load_config_from(&args.overrides.config)?;
    args.overrides.apply(&mut settings);
    let _guard = configuration::init_tracing(&settings.logging)?;

    stream_server::run_server(settings.server, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
