use clap::Parser;

use monkeyread_lib::cli::Args;

fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    // Show info for our code, warn for the socket stack
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info,tungstenite=warn,tokio_tungstenite=warn,rustls=warn"),
    )
    .format_timestamp(None)
    .init();

    // wss:// needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("monkeyread")
        .build()?;

    runtime.block_on(monkeyread_lib::run(args))
}
