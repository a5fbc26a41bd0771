use clap::{CommandFactory, Parser};
use colored::*;
use tracing_subscriber::EnvFilter;

use planroom::cli::{self, Args};
use planroom::config::Config;
use planroom::{console, web};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("planroom=info")),
        )
        .init();

    let args = Args::parse();

    if let Some(shell) = args.completions {
        clap_complete::generate(shell, &mut Args::command(), "planroom", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = Config::load()?;
    cli::apply_to_config(&args, &mut config);

    if args.serve {
        web::serve(&config).await?;
        return Ok(());
    }

    let Some(project) = args.project else {
        eprintln!(
            "{}",
            "A project id is required in console mode: planroom <project> [--name NAME]".bright_red()
        );
        eprintln!("{}", "Run with --serve to start the API server instead.".bright_blue());
        std::process::exit(2);
    };

    console::run(&config, &project, args.name).await?;
    Ok(())
}
