use std::path::Path;

use clap::Parser;
use vaultgraph::cli::{Cli, Commands, QueryArgs};
use vaultgraph::commands::{
    Vault, format_ingest, format_response, format_stats, to_json, validate_query,
};
use vaultgraph::config::Config;
use vaultgraph::logging;
use vaultgraph::search::SearchResponse;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::parse_from(["vaultgraph", "--help"]);
        return Ok(());
    };

    let config = Config::load()?;
    logging::init(&config.logging.level)?;

    tokio::runtime::Runtime::new()?.block_on(run(command, &config))
}

async fn run(command: Commands, config: &Config) -> anyhow::Result<()> {
    let vault = if command.needs_graph() {
        Vault::open(config).await?
    } else {
        Vault::open_store(config)?
    };
    let search = vault.search();

    match command {
        Commands::Search { query, args } => {
            validate_query(&query)?;
            let response = search.search(&query, &args.options()).await?;
            print_response(&query, &response, &args)
        }
        Commands::Tag { tag, args } => {
            let response = search.search_by_tag(&tag, &args.options()).await?;
            print_response(&format!("#{}", tag.trim_start_matches('#')), &response, &args)
        }
        Commands::Mocs { query, args } => {
            if let Some(query) = &query {
                validate_query(query)?;
            }
            let response = search.search_mocs(query.as_deref(), &args.options()).await?;
            print_response(query.as_deref().unwrap_or("maps of content"), &response, &args)
        }
        Commands::Conversations { query, args } => {
            validate_query(&query)?;
            let response = search.search_conversations(&query, &args.options()).await?;
            print_response(&query, &response, &args)
        }
        Commands::Related { file, args } => {
            let response = search.find_related_notes(&file, &args.options()).await?;
            print_response(&file, &response, &args)
        }
        Commands::Explore { concept, args } => {
            validate_query(&concept)?;
            let response = search
                .explore_knowledge_cluster(&concept, &args.options())
                .await?;
            print_response(&concept, &response, &args)
        }
        Commands::File { file, json } => {
            let args = QueryArgs {
                json,
                ..QueryArgs::default()
            };
            let response = search.get_file_chunks(&file, &args.options()).await?;
            print_response(&file, &response, &args)
        }
        Commands::Stats { json } => {
            let stats = search.stats().await?;
            if json {
                println!("{}", to_json(&stats)?);
            } else {
                print!("{}", format_stats(&stats));
            }
            Ok(())
        }
        Commands::Ingest { path, json } => {
            let reports = vault.ingest_file(Path::new(&path)).await?;
            if json {
                println!("{}", to_json(&reports)?);
            } else {
                print!("{}", format_ingest(&reports));
            }
            Ok(())
        }
        Commands::Delete { file } => {
            let report = vault.ingestor().delete_file(&file).await?;
            if report.chunk_ids.is_empty() {
                println!("No chunks found for '{file}'");
            } else {
                println!(
                    "Deleted {} chunk(s) from {file} ({} orphaned entities pruned)",
                    report.chunk_ids.len(),
                    report.pruned_entities.len()
                );
            }
            Ok(())
        }
        Commands::Clear => {
            let removed = vault.ingestor().clear_all().await?;
            println!("Removed {removed} chunk(s)");
            Ok(())
        }
        Commands::Reprocess => {
            let report = vault.ingestor().reprocess_pending().await?;
            println!(
                "Retried {} chunk(s): {} recovered, {} dropped, {} still pending",
                report.retried,
                report.recovered,
                report.dropped,
                report.still_pending.len()
            );
            Ok(())
        }
        #[cfg(feature = "mcp")]
        Commands::Serve => vaultgraph::mcp::serve(vault).await,
    }
}

fn print_response(subject: &str, response: &SearchResponse, args: &QueryArgs) -> anyhow::Result<()> {
    if args.json {
        println!("{}", to_json(response)?);
    } else {
        print!("{}", format_response(subject, response));
    }
    Ok(())
}
