use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use autotsd_core::client::{ConfluenceClient, ConfluenceClientConfig};
use autotsd_core::config::{
    AutoTsdConfig, DEFAULT_CONFIG_FILENAME, domain_base_url, load_config, write_default_config,
};
use autotsd_core::derive::{DerivedProperty, PropertyUpdate, resolve};
use autotsd_core::event::PageEvent;
use autotsd_core::extract::{PropertyMap, extract_properties};
use autotsd_core::mutate::apply_updates;
use autotsd_core::reconcile::{LabelDiff, reconcile, target_labels};
use autotsd_core::sync::{BatchReport, PageReport, PageStatus, PageSync, SyncOptions};
use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use similar::TextDiff;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "autotsd=info,autotsd_core=info";
const VERBOSE_LOG_FILTER: &str = "autotsd=debug,autotsd_core=debug";

#[derive(Debug, Parser)]
#[command(
    name = "autotsd",
    version,
    about = "Keep Confluence page labels in step with the page properties macro"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Config file (default: ./autotsd.toml)")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[arg(long, global = true, help = "Print reports as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Sync one page or every in-scope page of the space")]
    Label(LabelArgs),
    #[command(about = "Sync the page named by a Confluence content event (file or - for stdin)")]
    Event(EventArgs),
    #[command(about = "Write the default config file")]
    Init(InitArgs),
    #[command(about = "Show what a local storage-format file would produce, offline")]
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["page_id", "all"])))]
struct LabelArgs {
    #[arg(long, value_name = "ID", help = "Sync a single page")]
    page_id: Option<String>,
    #[arg(long, help = "Sync every page carrying a marker label")]
    all: bool,
    #[command(flatten)]
    sync: SyncArgs,
}

#[derive(Debug, Args)]
struct EventArgs {
    #[arg(value_name = "PATH")]
    path: String,
    #[command(flatten)]
    sync: SyncArgs,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, help = "Write changes (default is a dry run)")]
    execute: bool,
    #[arg(long, value_name = "N", help = "Pages synced in parallel in --all mode")]
    concurrency: Option<usize>,
    #[arg(long, value_name = "KEY", help = "Confluence space key")]
    space: Option<String>,
    #[arg(long, value_name = "NAME", help = "Atlassian site name or URL")]
    domain: Option<String>,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[arg(value_name = "PATH")]
    path: PathBuf,
    #[arg(
        long,
        value_name = "LABELS",
        value_delimiter = ',',
        help = "Existing labels to diff against"
    )]
    labels: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
}

#[derive(Debug, Serialize)]
struct InspectReport<'a> {
    path: String,
    properties: &'a PropertyMap,
    derived: &'a [DerivedProperty],
    updates: &'a [PropertyUpdate],
    target_labels: BTreeSet<String>,
    diff: LabelDiff,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    let output = Output { json: cli.json };

    match cli.command {
        Some(Commands::Label(args)) => run_label(&config_path, output, args),
        Some(Commands::Event(args)) => run_event(&config_path, output, args),
        Some(Commands::Init(args)) => run_init(&config_path, args),
        Some(Commands::Inspect(args)) => run_inspect(&config_path, output, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_label(config_path: &Path, output: Output, args: LabelArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let client = build_client(&config, &args.sync)?;
    let sync = PageSync::new(&client, sync_options(&config, &args.sync));

    if let Some(page_id) = args.page_id.as_deref() {
        let report = sync.sync_page(page_id);
        print_page_report(&report, output)?;
        return ensure_page_succeeded(&report);
    }

    let space = args
        .sync
        .space
        .clone()
        .unwrap_or_else(|| config.confluence.space());
    let query = config.batch_query(&space);
    info!(query = %query, "syncing all matching pages");
    let report = sync.sync_all(&query);
    print_batch_report(&report, output)?;
    if let Some(reason) = &report.aborted {
        bail!("batch aborted: {reason}");
    }
    if report.failed > 0 {
        bail!("{} of {} page(s) failed", report.failed, report.processed);
    }
    Ok(())
}

fn run_event(config_path: &Path, output: Output, args: EventArgs) -> Result<()> {
    let raw = if args.path == "-" {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read event from stdin")?;
        buffer
    } else {
        fs::read_to_string(&args.path).with_context(|| format!("failed to read {}", args.path))?
    };
    let event = PageEvent::parse(&raw)?;
    let page_id = event.page_id()?;
    info!(
        page = page_id,
        title = %event.content.title,
        action = event.action(),
        "received content event"
    );

    let config = load_config(config_path)?;
    let client = build_client(&config, &args.sync)?;
    let sync = PageSync::new(&client, sync_options(&config, &args.sync));
    let report = sync.sync_page(page_id);
    print_page_report(&report, output)?;
    ensure_page_succeeded(&report)
}

fn run_init(config_path: &Path, args: InitArgs) -> Result<()> {
    if write_default_config(config_path, args.force)? {
        println!("wrote: {}", normalize_path(config_path));
    } else {
        println!(
            "exists: {} (use --force to overwrite)",
            normalize_path(config_path)
        );
    }
    Ok(())
}

fn run_inspect(config_path: &Path, output: Output, args: InspectArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let raw = fs::read_to_string(&args.path)
        .with_context(|| format!("failed to read {}", args.path.display()))?;
    let properties = extract_properties(&raw)
        .with_context(|| format!("failed to extract properties from {}", args.path.display()))?;
    let resolution = resolve(&properties, &config.derived_ids);
    let existing = args
        .labels
        .iter()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .collect::<BTreeSet<_>>();

    let report = InspectReport {
        path: normalize_path(&args.path),
        properties: &properties,
        derived: &resolution.derived,
        updates: &resolution.updates,
        target_labels: target_labels(&config.vocabulary, &properties),
        diff: reconcile(&config.vocabulary, &properties, &existing),
    };

    if output.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("inspect");
    println!("path: {}", report.path);
    print_properties(report.properties);
    print_derived(report.derived);
    println!("target_labels: {}", join_labels(&report.target_labels));
    print_diff(&report.diff);
    if resolution.changed() {
        let mutated = apply_updates(&raw, &resolution.updates)
            .with_context(|| format!("failed to apply derived ids to {}", args.path.display()))?;
        print_markup_diff(&raw, &mutated);
    }
    Ok(())
}

fn build_client(config: &AutoTsdConfig, args: &SyncArgs) -> Result<ConfluenceClient> {
    let mut client_config = ConfluenceClientConfig::from_config(config);
    if let Some(domain) = args.domain.as_deref() {
        client_config.base_url = domain_base_url(domain);
    }
    ConfluenceClient::new(client_config)
}

fn sync_options(config: &AutoTsdConfig, args: &SyncArgs) -> SyncOptions {
    let mut options = SyncOptions::from_config(config);
    options.execute |= args.execute;
    if let Some(concurrency) = args.concurrency {
        options.concurrency = concurrency.max(1);
    }
    options
}

fn ensure_page_succeeded(report: &PageReport) -> Result<()> {
    if report.status == PageStatus::Failed {
        bail!(
            "page {} failed: {}",
            report.page_id,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_page_report(report: &PageReport, output: Output) -> Result<()> {
    if output.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    print_page_summary(report);
    if !report.executed
        && let Some(change) = &report.markup_change
    {
        print_markup_diff(&change.before, &change.after);
    }
    Ok(())
}

fn print_page_summary(report: &PageReport) {
    for line in page_summary_lines(report) {
        println!("{line}");
    }
}

fn page_summary_lines(report: &PageReport) -> Vec<String> {
    let mut lines = vec![
        format!(
            "page: {} ({})",
            report.page_id,
            report.title.as_deref().unwrap_or("<unknown>")
        ),
        format!("status: {}", status_name(report.status)),
        format!("mode: {}", if report.executed { "execute" } else { "dry-run" }),
    ];
    if let Some(error) = &report.error {
        lines.push(format!("error: {error}"));
    }
    if !report.label_failures.is_empty() {
        lines.push("label_failures:".to_string());
        for failure in &report.label_failures {
            lines.push(format!("  - {}: {}", failure.label, failure.error));
        }
    }
    if report.status != PageStatus::Done {
        return lines;
    }
    lines.extend(property_lines(&report.properties));
    lines.extend(derived_lines(&report.derived));
    lines.extend(diff_lines(&report.diff));
    lines.push(format!("markup_changed: {}", format_flag(report.markup_changed)));
    if let Some(version) = report.new_version {
        lines.push(format!("new_version: {version}"));
    }
    lines
}

fn print_batch_report(report: &BatchReport, output: Output) -> Result<()> {
    if output.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("batch");
    println!("query: {}", report.query);
    println!("processed: {}", report.processed);
    println!("done: {}", report.done);
    println!("rejected: {}", report.rejected);
    println!("failed: {}", report.failed);
    println!("requests: {}", report.request_count);
    if let Some(reason) = &report.aborted {
        println!("aborted: {reason}");
    }
    for page in &report.pages {
        let changes = if page.diff.is_empty() && !page.markup_changed {
            "no changes".to_string()
        } else {
            format!(
                "+{} -{} labels{}",
                page.diff.to_add.len(),
                page.diff.to_remove.len(),
                if page.markup_changed { ", markup" } else { "" }
            )
        };
        println!(
            "  - {} {} [{}] {}",
            page.page_id,
            page.title.as_deref().unwrap_or("<unknown>"),
            status_name(page.status),
            page.error.as_deref().unwrap_or(&changes)
        );
    }
    Ok(())
}

fn print_properties(properties: &PropertyMap) {
    for line in property_lines(properties) {
        println!("{line}");
    }
}

fn property_lines(properties: &PropertyMap) -> Vec<String> {
    let mut lines = vec![format!("properties: {}", properties.len())];
    for (key, value) in properties.iter() {
        match value.href() {
            Some(href) => lines.push(format!("  {key}: {} <{href}>", value.text())),
            None => lines.push(format!("  {key}: {}", value.text())),
        }
    }
    lines
}

fn print_derived(derived: &[DerivedProperty]) {
    for line in derived_lines(derived) {
        println!("{line}");
    }
}

fn derived_lines(derived: &[DerivedProperty]) -> Vec<String> {
    derived
        .iter()
        .map(|property| {
            format!(
                "derived: {} = {} (from {})",
                property.key, property.value, property.source_key
            )
        })
        .collect()
}

fn print_diff(diff: &LabelDiff) {
    for line in diff_lines(diff) {
        println!("{line}");
    }
}

fn diff_lines(diff: &LabelDiff) -> Vec<String> {
    vec![
        format!("labels.add: {}", join_labels(&diff.to_add)),
        format!("labels.remove: {}", join_labels(&diff.to_remove)),
    ]
}

/// Storage markup usually sits on one line; break before each row so the diff
/// points at the row that changed.
fn print_markup_diff(before: &str, after: &str) {
    let before = before.replace("<tr>", "\n<tr>");
    let after = after.replace("<tr>", "\n<tr>");
    let diff = TextDiff::from_lines(&before, &after);
    println!("markup:");
    print!(
        "{}",
        diff.unified_diff()
            .context_radius(1)
            .header("current", "proposed")
    );
}

fn join_labels(labels: &BTreeSet<String>) -> String {
    if labels.is_empty() {
        "<none>".to_string()
    } else {
        labels.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

fn status_name(status: PageStatus) -> &'static str {
    match status {
        PageStatus::Done => "done",
        PageStatus::Rejected => "rejected",
        PageStatus::Failed => "failed",
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
