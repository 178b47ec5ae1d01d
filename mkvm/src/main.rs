use clap::Parser;
use mkvm::{Cli, run};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    install_tracing(&cli.log);

    if let Err(err) = run(cli).await {
        tracing::error!("{err}");
        if let Some(known) = err.known_distros() {
            println!("Here are distros I know about:");
            for name in known {
                println!("{name}");
            }
        }
        if let Some(remedy) = err.remedy() {
            // Printed outside of logging so a quiet --log can't hide it.
            eprintln!("you should run this command:\n\n{remedy}\n");
        }
        std::process::exit(1);
    }
}

pub fn install_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .with_ansi(false)
        .init();
}
