use anyhow::Result;
use clap::Parser;

use logstat::commands::serve::ServeOverrides;
use logstat::{cli, commands, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    match args.get_command() {
        cli::Commands::Serve {
            host,
            tcp_port,
            http_port,
            db_path,
            bucket_minutes,
        } => {
            commands::serve::execute(
                &args.config,
                ServeOverrides {
                    host,
                    tcp_port,
                    http_port,
                    db_path,
                    bucket_minutes,
                },
            )
            .await?;
        }
        cli::Commands::Query(query_args) => {
            init_tracing("warn");
            commands::query::execute(&args.config, query_args).await?;
        }
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&args.config)?,
            cli::ConfigCommands::Validate => commands::config::validate(&args.config)?,
        },
        cli::Commands::Version => {
            println!("logstat v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
