mod cli;

use trove::{bootstrap, config, output, Trove};

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, MediaTypeArg, NegotiationArg, QueryArgs};
use std::sync::Arc;
use trove_core::{
    Caps, KeyId, Media, Negotiation, OperationOptions, ResolutionFlags, TypeFilter,
};
use trove_source::Source;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config_or_default(cli.config.as_deref())?;

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "trove=debug".to_string()
        } else {
            config.log.filter.clone()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let warnings = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }

    let trove = bootstrap(config)?;

    match cli.command {
        Commands::Keys => list_keys(&trove),
        Commands::Sources => list_sources(&trove),
        Commands::Inspect { source } => inspect(&trove, &source),
        Commands::Browse {
            source,
            container,
            query,
        } => browse(&trove, &source, container, &query),
        Commands::Search {
            sources,
            text,
            query,
        } => search(&trove, &sources, text.as_deref(), &query),
        Commands::Query {
            source,
            query_string,
            query,
        } => run_query(&trove, &source, &query_string, &query),
        Commands::Resolve {
            source,
            media_id,
            query,
        } => resolve(&trove, &source, &media_id, &query),
        Commands::CheckConfig => check_config(&trove, &warnings),
    }
}

// ---------------------------------------------------------------------------
// Option plumbing
// ---------------------------------------------------------------------------

fn operation_options(args: &QueryArgs) -> OperationOptions {
    let negotiation = match args.negotiation {
        NegotiationArg::Strict => Negotiation::Strict,
        NegotiationArg::Partial => Negotiation::Partial,
        NegotiationArg::Emulate => Negotiation::Emulate,
    };

    let mut flags = ResolutionFlags::NORMAL;
    if args.full {
        flags |= ResolutionFlags::FULL;
    }
    if args.fast_only {
        flags |= ResolutionFlags::FAST_ONLY;
    }

    let mut options = OperationOptions::new().with_negotiation(negotiation);
    if args.skip > 0 {
        options = options.with_skip(args.skip);
    }
    if !flags.is_empty() {
        options = options.with_flags(flags);
    }
    if let Some(count) = args.count {
        options = options.with_count(count);
    }
    if !args.types.is_empty() {
        let filter = args.types.iter().fold(TypeFilter::NONE, |acc, t| {
            acc | match t {
                MediaTypeArg::Audio => TypeFilter::AUDIO,
                MediaTypeArg::Video => TypeFilter::VIDEO,
                MediaTypeArg::Image => TypeFilter::IMAGE,
                MediaTypeArg::Container => TypeFilter::CONTAINER,
            }
        });
        options = options.with_type_filter(filter);
    }
    options
}

fn key_list(trove: &Trove, args: &QueryArgs) -> Result<Vec<KeyId>> {
    Ok(trove.registry.keys().key_list(&args.keys)?)
}

fn source(trove: &Trove, id: &str) -> Result<Arc<dyn Source>> {
    Ok(trove.registry.require_source(id)?)
}

fn print_media(trove: &Trove, items: &[Media], json: bool) -> Result<()> {
    let keys = trove.registry.keys();
    if json {
        let values: Vec<_> = items.iter().map(|m| output::media_json(keys, m)).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else {
        for media in items {
            println!("{}", output::media_line(keys, media));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn list_keys(trove: &Trove) -> Result<()> {
    let keys = trove.registry.keys();
    for id in keys.all_keys() {
        if let Some(key) = keys.get(id) {
            println!(
                "{:>3}  {:<26} {:<9} {}",
                id.raw(),
                key.name(),
                key.key_type().as_str(),
                key.description()
            );
        }
    }
    Ok(())
}

fn list_sources(trove: &Trove) -> Result<()> {
    let sources = trove.registry.sources(true);
    if sources.is_empty() {
        println!("No sources configured.");
    }
    for source in sources {
        let rank = trove.registry.rank(source.id()).unwrap_or(source.info().rank);
        println!(
            "{:>5}  {:<16} {:<20} {}",
            rank,
            source.id(),
            source.info().name,
            operations(source.as_ref())
        );
    }
    Ok(())
}

fn operations(source: &dyn Source) -> String {
    source
        .supported_operations()
        .kinds()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn inspect(trove: &Trove, id: &str) -> Result<()> {
    let source = source(trove, id)?;
    let info = source.info();
    let keys = trove.registry.keys();
    let name = |key: &KeyId| keys.name(*key).unwrap_or_else(|| key.to_string());

    println!("Source: {} ({})", info.id, info.name);
    if !info.description.is_empty() {
        println!("Description: {}", info.description);
    }
    println!("Version: {}", info.version);
    println!("Rank: {}", trove.registry.rank(&info.id).unwrap_or(info.rank));
    if let Some(threshold) = info.auto_split_threshold {
        println!("Auto-split: {threshold}");
    }
    println!("Operations: {}", operations(source.as_ref()));

    println!("\nKeys:");
    for key in source.supported_keys() {
        let mut marks = Vec::new();
        if source.slow_keys().contains(key) {
            marks.push("slow");
        }
        if source.writable_keys().contains(key) {
            marks.push("writable");
        }
        if marks.is_empty() {
            println!("  {}", name(key));
        } else {
            println!("  {} ({})", name(key), marks.join(", "));
        }
    }

    println!("\nCaps:");
    for kind in source.supported_operations().kinds() {
        let caps = source.caps(kind);
        println!("  {}: {}", kind, describe_caps(&caps, &name));
    }
    Ok(())
}

fn describe_caps(caps: &Caps, name: &dyn Fn(&KeyId) -> String) -> String {
    let mut parts = Vec::new();
    if caps.supports_pagination() {
        parts.push("pagination".to_string());
    }
    if caps.supports_flags() {
        parts.push("flags".to_string());
    }
    let types: Vec<&str> = [
        (TypeFilter::AUDIO, "audio"),
        (TypeFilter::VIDEO, "video"),
        (TypeFilter::IMAGE, "image"),
        (TypeFilter::CONTAINER, "container"),
    ]
    .into_iter()
    .filter(|(flag, _)| caps.type_filter().contains(*flag))
    .map(|(_, label)| label)
    .collect();
    if !types.is_empty() {
        parts.push(format!("types={}", types.join("|")));
    }
    if !caps.key_filters().is_empty() {
        let keys: Vec<String> = caps.key_filters().iter().map(name).collect();
        parts.push(format!("filters={}", keys.join("|")));
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

fn browse(trove: &Trove, id: &str, container: Option<String>, args: &QueryArgs) -> Result<()> {
    let source = source(trove, id)?;
    let container = container.map(|id| Media::container().with_id(id));
    let items = trove
        .dispatcher
        .browse_sync(&source, container.as_ref(), &key_list(trove, args)?, &operation_options(args))
        .with_context(|| format!("browse on '{id}' failed"))?;
    print_media(trove, &items, args.json)
}

fn search(trove: &Trove, ids: &[String], text: Option<&str>, args: &QueryArgs) -> Result<()> {
    let keys = key_list(trove, args)?;
    let options = operation_options(args);

    let items = match ids {
        [id] => {
            let source = source(trove, id)?;
            trove.dispatcher.search_sync(&source, text, &keys, &options)?
        }
        _ => {
            let sources = ids
                .iter()
                .map(|id| source(trove, id))
                .collect::<Result<Vec<_>>>()?;
            let selected = (!sources.is_empty()).then_some(sources.as_slice());
            trove
                .dispatcher
                .multiple_search_sync(selected, text, &keys, &options)?
        }
    };
    print_media(trove, &items, args.json)
}

fn run_query(trove: &Trove, id: &str, query: &str, args: &QueryArgs) -> Result<()> {
    let source = source(trove, id)?;
    let items = trove
        .dispatcher
        .query_sync(&source, query, &key_list(trove, args)?, &operation_options(args))
        .with_context(|| format!("query on '{id}' failed"))?;
    print_media(trove, &items, args.json)
}

fn resolve(trove: &Trove, id: &str, media_id: &str, args: &QueryArgs) -> Result<()> {
    let source = source(trove, id)?;
    let mut media = Media::generic().with_id(media_id);
    media.set_source(id);
    let resolved = trove
        .dispatcher
        .resolve_sync(&source, &media, &key_list(trove, args)?, &operation_options(args))
        .with_context(|| format!("resolve of '{media_id}' on '{id}' failed"))?;
    print_media(trove, std::slice::from_ref(&resolved), args.json)
}

fn check_config(trove: &Trove, warnings: &[String]) -> Result<()> {
    println!("Sources: {}", trove.registry.len());
    for source in trove.registry.sources(true) {
        println!("  ✓ {} ({})", source.id(), source.info().name);
    }
    for (id, reason) in &trove.skipped {
        println!("  ✗ {id}: {reason}");
    }
    for warning in warnings {
        println!("Warning: {warning}");
    }

    if !trove.skipped.is_empty() {
        anyhow::bail!("{} source(s) could not be created", trove.skipped.len());
    }
    println!("✓ Configuration is valid");
    Ok(())
}
