use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wikigit_core::config::load_config;
use wikigit_core::live::{MediaWikiClient, MediaWikiClientConfig};
use wikigit_core::runtime::{PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths};
use wikigit_core::sync::{
    ArchiveOptions, SyncMode, SyncReport, SyncSettings, import_archive, sync_document,
};

#[derive(Debug, Parser)]
#[command(
    name = "wikigit",
    version,
    about = "Replay the revision history of wiki documents into a git repository"
)]
struct Cli {
    #[arg(
        value_name = "DOCUMENT",
        required_unless_present = "archive",
        conflicts_with = "archive",
        help = "Title of the document to fetch from the live wiki"
    )]
    document: Option<String>,
    #[arg(long, value_name = "PATH", help = "Import a MediaWiki XML export instead")]
    archive: Option<PathBuf>,
    #[arg(
        short,
        long,
        value_name = "CODE",
        help = "Wiki language (live default: en; archives infer it)"
    )]
    language: Option<String>,
    #[arg(short, long, action = ArgAction::Count, help = "Increase log verbosity (-v, -vv, -vvv)")]
    verbose: u8,
    #[arg(long, value_name = "PATH", help = "Directory holding one repository per wiki")]
    output_root: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "CURSOR",
        conflicts_with = "archive",
        help = "Continue an interrupted fetch from this continuation token"
    )]
    resume_from: Option<String>,
    #[arg(long, requires = "archive", help = "Rebuild the repository from the archive")]
    replace: bool,
    #[arg(long, help = "Print the run report as JSON")]
    json: bool,
    #[arg(long, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let paths = resolve_runtime_paths(&cli)?;
    let config = load_config(&paths.config_path)?;
    let settings =
        SyncSettings::from_config(&config, paths.output_root.clone(), cli.language.clone());

    let report = if let Some(archive) = cli.archive.as_deref() {
        import_archive(
            &settings,
            archive,
            ArchiveOptions {
                replace: cli.replace,
            },
        )?
    } else {
        let title = cli
            .document
            .as_deref()
            .context("a DOCUMENT title or --archive is required")?;
        let client_config = MediaWikiClientConfig::from_config(&config, settings.live_language());
        let mut client = MediaWikiClient::new(client_config)?;
        info!(api_url = %client.api_url(), document = %title, "starting live sync");
        sync_document(&settings, title, cli.resume_from.clone(), &mut client)?
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if cli.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_runtime_paths(cli: &Cli) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        output_root: cli.output_root.clone(),
        config: cli.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    if let Some(project_root) = initial.output_root.parent() {
        let project_env = project_root.join(".env");
        if project_env.exists() {
            let _ = dotenvy::from_path_override(&project_env);
        }
    }

    resolve_paths(&context, &overrides)
}

fn print_report(report: &SyncReport) {
    let mode = match report.mode {
        SyncMode::Live => "live sync",
        SyncMode::Archive => "archive import",
    };
    println!("wikigit {mode}");
    println!("repository: {}", report.repository);
    println!("language: {}", report.language);
    println!("documents: {}", report.documents.join(", "));
    println!("fetched: {}", report.fetched);
    println!("rejected: {}", report.rejected);
    println!("already_committed: {}", report.duplicates);
    if report.queued == 0 {
        println!("no new revisions");
    } else {
        println!("committed: {} of {}", report.committed, report.queued);
    }
    if !report.siblings_restored.is_empty() {
        println!("siblings_restored: {}", report.siblings_restored.join(", "));
    }
    if report.request_count > 0 {
        println!("requests: {}", report.request_count);
    }
    if !report.failed.is_empty() {
        println!("failed:");
        for failure in &report.failed {
            println!(
                "  - {} @ {}: {}",
                failure.document, failure.timestamp, failure.error
            );
        }
    }
    if let Some(interrupted) = &report.interrupted {
        println!("interrupted: {interrupted}");
        if let Some(cursor) = &report.resume_cursor {
            println!("resume with: --resume-from '{cursor}'");
        }
    }
}
