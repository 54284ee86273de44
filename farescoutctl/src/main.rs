use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "farescoutctl=info,farescout_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = farescoutctl::Cli::parse();
    if let Err(err) = farescoutctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
