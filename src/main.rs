use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use murmur::{Daemon, Settings};

/// Murmur - voice-first ambient AI assistant
#[derive(Parser)]
#[command(name = "murmur", version, about)]
struct Cli {
    /// Port for the health/metrics API
    #[arg(long, env = "MURMUR_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable voice I/O (for headless hosts without audio hardware)
    #[arg(long, env = "MURMUR_DISABLE_VOICE")]
    disable_voice: bool,

    /// Process one text utterance through the pipeline and exit
    #[arg(long, value_name = "TEXT")]
    once: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => std::env::var("MURMUR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        1 => "info,murmur=debug".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(port) = cli.port {
        settings.api_port = port;
    }

    // The one-shot text path never touches audio hardware
    if let Some(text) = cli.once {
        let mut daemon = Daemon::new(settings, true)?;
        let reply = daemon.process_text(&text).await?;
        println!("{reply}");
        return Ok(());
    }

    tracing::info!(
        port = settings.api_port,
        disable_voice = cli.disable_voice,
        "starting murmur"
    );

    let daemon = Daemon::new(settings, cli.disable_voice)?;
    daemon.run().await?;

    Ok(())
}
