use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kindle_org::clippings::parse_clippings;
use kindle_org::format_library;
use kindle_org::outline::NomOutlineParser;
use kindle_org::reader::parse_org_with;
use kindle_org::storage::OutlineParser;
use kindle_org::sync::{self, SyncConfig, write_atomically};
use tracing::{Level, debug, info};

#[derive(Debug, Parser)]
#[command(
    name = "kindle-org",
    about = "Import Kindle clippings into an Org outline",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge a clippings export into an Org outline, keeping edits made there.
    Sync(SyncArgs),

    /// Parse a clippings export and print it without touching any file.
    Parse(ParseArgs),

    /// Re-render an Org outline in canonical form.
    Format(FormatArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Clippings file on a mounted device, copied over --kindle first.
    #[arg(short, long)]
    mounted: Option<PathBuf>,
    /// Local copy of `My Clippings.txt`.
    #[arg(short, long)]
    kindle: PathBuf,
    /// Org outline to merge into; created when missing.
    #[arg(short, long)]
    org: PathBuf,
    /// Print the merged outline instead of writing it.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Clippings export to read.
    input: PathBuf,
    /// Emit the record model as JSON instead of Org text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org outline to format.
    input: PathBuf,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Sync(args) => handle_sync(args),
        Commands::Parse(args) => handle_parse(args),
        Commands::Format(args) => handle_format(args),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn handle_sync(args: SyncArgs) -> Result<()> {
    let SyncArgs {
        mounted,
        kindle,
        org,
        dry_run,
    } = args;
    let config = SyncConfig {
        mounted,
        clippings: kindle,
        output: org,
        dry_run,
    };

    let report = sync::run(&config)?;
    info!(
        authors = report.authors,
        books = report.books,
        annotations = report.annotations,
        added = report.added,
        "sync finished"
    );
    if report.written {
        println!(
            "Wrote {} annotations ({} new) to {:?}",
            report.annotations, report.added, config.output
        );
    } else {
        print!("{}", report.rendered);
    }
    Ok(())
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { input, json } = args;
    let raw = fs::read_to_string(&input).with_context(|| format!("reading {:?}", input))?;
    let library = parse_clippings(&raw).with_context(|| format!("parsing {:?}", input))?;
    debug!(books = library.book_count(), "parsed clippings");

    if json {
        println!("{}", serde_json::to_string_pretty(&library)?);
    } else {
        print!("{}", format_library(&library));
    }
    Ok(())
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs { input, in_place } = args;
    let text = format_outline_file(&NomOutlineParser, &input)?;

    if in_place {
        write_atomically(&input, &text)?;
        info!(path = %input.display(), "formatted in place");
    } else {
        print!("{text}");
    }
    Ok(())
}

fn format_outline_file<P: OutlineParser>(parser: &P, path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let library = parse_org_with(parser, &raw).with_context(|| format!("parsing {:?}", path))?;
    Ok(format_library(&library))
}
