use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{filter::LevelFilter, fmt};

use gemsieve::AppError;
use gemsieve::cli::{
    Cli, Commands, DbArgs, ExportArgs, ExportFormatArg, GemsArgs, GenerateArgs, IngestArgs,
    OverrideArgs, OverridesArgs, RelationshipArgs, RelationshipsArgs, RunArgs, StatsArgs, WebArgs,
};
use gemsieve::config::{self, Config};
use gemsieve::export::{self, ExportFormat};
use gemsieve::known::parse_relationship_import;
use gemsieve::mail::snapshot::SnapshotMailProvider;
use gemsieve::mail::{MailError, SyncEngine, SyncOutcome};
use gemsieve::models::{GemType, RelationshipType, Strategy};
use gemsieve::pipeline::{Orchestrator, RunOptions, Services};
use gemsieve::server;
use gemsieve::stages::relationships;
use gemsieve::store::{GemFilter, Store};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(log_level(cli.verbose));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = config::load_from(cli.config.clone())?;

    match cli.command {
        Some(Commands::Ingest(args)) => run_ingest(&config, args).await,
        Some(Commands::Parse(args)) => {
            run_stages(&config, &[args.stage.stage_name()], RunOptions::default()).await
        }
        Some(Commands::Classify(args)) => {
            reject_crew(args.crew)?;
            let options = RunOptions {
                retrain: args.retrain,
                model_spec: args.model,
                ..RunOptions::default()
            };
            run_stages(&config, &["classify"], options).await
        }
        Some(Commands::Profile) => run_stages(&config, &["profile"], RunOptions::default()).await,
        Some(Commands::Gems(args)) => run_gems(&config, args),
        Some(Commands::Override(args)) => run_override(&config, args),
        Some(Commands::Overrides(args)) => run_overrides(&config, args),
        Some(Commands::Generate(args)) => run_generate(&config, args).await,
        Some(Commands::Relationship(args)) => run_relationship(&config, args),
        Some(Commands::Relationships(args)) => run_relationships(&config, args),
        Some(Commands::Stats(args)) => run_stats(&config, args),
        Some(Commands::Export(args)) => run_export(&config, args),
        Some(Commands::Db(args)) => run_db(&config, args),
        Some(Commands::Run(args)) => run_full(&config, args).await,
        Some(Commands::Web(args)) => run_web(config, args).await,
        None => {
            Cli::print_help();
            Ok(())
        }
    }
}

fn reject_crew(crew: bool) -> Result<(), AppError> {
    if crew {
        return Err(AppError::CrewUnsupported);
    }
    Ok(())
}

fn open_store(config: &Config) -> Result<Store, AppError> {
    Ok(Store::open(&config.storage.sqlite_path)?)
}

async fn run_ingest(config: &Config, args: IngestArgs) -> Result<(), AppError> {
    let Some(snapshot_path) = SnapshotMailProvider::configured_path() else {
        return Err(AppError::Mail(MailError::Auth(
            "no mail provider configured; set GEMSIEVE_MAILBOX_SNAPSHOT to a mailbox export \
             or deploy the Gmail adapter"
                .to_string(),
        )));
    };
    let provider = SnapshotMailProvider::open(&snapshot_path).map_err(AppError::Mail)?;
    let store = open_store(config)?;
    let engine = SyncEngine::new(&provider, &store);

    if args.sync && !args.append {
        match engine.incremental_sync().await.map_err(sync_err)? {
            SyncOutcome::Stored(stored) => {
                println!("Incremental sync stored {stored} new message(s)");
                return Ok(());
            }
            SyncOutcome::CursorExpired => {
                println!("History cursor expired; falling back to a full sync");
            }
        }
    }

    let query = args
        .query
        .unwrap_or_else(|| config.gmail.default_query.clone());
    let progress = make_progress_bar();
    let mut update = |seen: usize, stored: usize| {
        progress.set_position(seen as u64);
        progress.set_message(format!("{stored} stored"));
    };
    let stored = engine
        .full_sync(&query, Some(&mut update))
        .await
        .map_err(sync_err)?;
    progress.finish_with_message(format!("{stored} message(s) stored"));
    Ok(())
}

fn sync_err(err: gemsieve::mail::SyncError) -> AppError {
    match err {
        gemsieve::mail::SyncError::Mail(e) => AppError::Mail(e),
        gemsieve::mail::SyncError::Store(e) => AppError::Store(e),
    }
}

async fn run_stages(
    config: &Config,
    stages: &[&str],
    options: RunOptions,
) -> Result<(), AppError> {
    let services = Arc::new(Services::from_config(config.clone()));
    let orchestrator = Arc::new(Orchestrator::new(services, "cli"));
    for stage in stages {
        let (run_id, report) = orchestrator.run_stage(stage, options.clone()).await?;
        match report.error_summary() {
            Some(summary) => println!(
                "{stage}: run {run_id} processed {} item(s) ({summary})",
                report.processed
            ),
            None => println!("{stage}: run {run_id} processed {} item(s)", report.processed),
        }
    }
    Ok(())
}

fn run_gems(config: &Config, args: GemsArgs) -> Result<(), AppError> {
    let store = open_store(config)?;

    if let Some(id) = args.explain {
        let gem = store.get_gem(id)?.ok_or(AppError::GemNotFound(id))?;
        println!("{}", serde_json::to_string_pretty(&gem.explanation)?);
        return Ok(());
    }

    let filter = GemFilter {
        gem_type: match &args.gem_type {
            Some(raw) => Some(
                GemType::from_str(raw).map_err(|_| AppError::InvalidGemType(raw.clone()))?,
            ),
            None => None,
        },
        segment: args.segment.clone(),
        limit: args.top,
        ..GemFilter::default()
    };
    let gems = store.list_gems(&filter)?;
    if gems.is_empty() {
        println!("No gems detected yet. Run the pipeline first.");
        return Ok(());
    }
    for gem in gems {
        println!(
            "#{:<5} {:<22} {:<28} score {:<3} [{}] {}",
            gem.id,
            gem.gem_type,
            gem.sender_domain,
            gem.score,
            gem.status,
            gem.explanation.summary,
        );
    }
    Ok(())
}

fn run_override(config: &Config, args: OverrideArgs) -> Result<(), AppError> {
    let store = open_store(config)?;
    let id = store.add_override(
        &args.field,
        &args.value,
        args.sender.as_deref(),
        args.message.as_deref(),
    )?;
    println!(
        "Override {id} stored: {} -> {} (re-run classify to apply)",
        args.field, args.value
    );
    Ok(())
}

fn run_overrides(config: &Config, args: OverridesArgs) -> Result<(), AppError> {
    let store = open_store(config)?;
    if args.stats {
        let stats = store.override_stats()?;
        if stats.is_empty() {
            println!("No overrides recorded.");
            return Ok(());
        }
        for (field, count, total, rate) in stats {
            let flag = if rate > 20.0 { "  <- needs prompt tuning" } else { "" };
            println!("{field:<28} {count:>4} override(s) / {total} classified ({rate:.1}%){flag}");
        }
        return Ok(());
    }
    // --list is the default action.
    let _ = args.list;
    for row in store.list_overrides()? {
        let target = row
            .message_id
            .clone()
            .or(row.sender_domain.clone())
            .unwrap_or_default();
        println!(
            "#{:<4} [{}] {:<24} {} : {} -> {}",
            row.id,
            row.override_scope,
            target,
            row.field_name,
            row.original_value.as_deref().unwrap_or("unknown"),
            row.corrected_value,
        );
    }
    Ok(())
}

async fn run_generate(config: &Config, args: GenerateArgs) -> Result<(), AppError> {
    reject_crew(args.crew)?;
    let strategy = match &args.strategy {
        Some(raw) => {
            Some(Strategy::from_str(raw).map_err(|_| AppError::InvalidStrategy(raw.clone()))?)
        }
        None => None,
    };
    let options = RunOptions {
        gem_id: args.gem,
        strategy,
        top_n: args.top,
        generate_all: args.all,
        ..RunOptions::default()
    };
    run_stages(config, &["engage"], options).await
}

fn run_relationship(config: &Config, args: RelationshipArgs) -> Result<(), AppError> {
    let relationship = RelationshipType::from_str(&args.relationship_type)
        .map_err(|_| AppError::InvalidRelationshipType(args.relationship_type.clone()))?;
    let store = open_store(config)?;
    store.set_relationship(
        &args.sender,
        relationship,
        args.note.as_deref(),
        args.suppress,
        "manual",
    )?;
    println!("{} -> {relationship}", args.sender);
    Ok(())
}

fn run_relationships(config: &Config, args: RelationshipsArgs) -> Result<(), AppError> {
    let store = open_store(config)?;

    if let Some(path) = &args.import {
        let raw = std::fs::read_to_string(path).map_err(|source| AppError::Io {
            path: path.clone(),
            source,
        })?;
        let sections = parse_relationship_import(&raw)
            .map_err(|e| AppError::InvalidRelationshipType(e.to_string()))?;
        let mut imported = 0usize;
        for (type_name, domains) in sections {
            let relationship = RelationshipType::from_str(&type_name)
                .map_err(|_| AppError::InvalidRelationshipType(type_name.clone()))?;
            let suppress = matches!(
                relationship,
                RelationshipType::MyInfrastructure | RelationshipType::Institutional
            );
            for domain in domains {
                store.set_relationship(
                    &domain,
                    relationship,
                    Some(&format!("Imported from {}", path.display())),
                    suppress,
                    "manual",
                )?;
                imported += 1;
            }
        }
        println!("Imported {imported} relationship(s)");
        return Ok(());
    }

    if args.auto_detect {
        let services = Services::from_config(config.clone());
        let proposals = relationships::detect_all(&store, &services.known, args.apply)?;
        for proposal in &proposals {
            println!(
                "{:<30} {:<20} confidence {:.2}",
                proposal.sender_domain, proposal.proposed_type, proposal.confidence,
            );
        }
        if args.apply {
            println!(
                "Applied detections at confidence >= {:.1}",
                relationships::APPLY_THRESHOLD
            );
        }
        return Ok(());
    }

    let type_filter = match &args.type_filter {
        Some(raw) => Some(
            RelationshipType::from_str(raw)
                .map_err(|_| AppError::InvalidRelationshipType(raw.clone()))?,
        ),
        None => None,
    };
    let _ = args.list;
    for row in store.list_relationships(type_filter)? {
        let suppress = if row.suppress_gems { " [suppressed]" } else { "" };
        println!(
            "{:<30} {:<20} ({}){suppress}",
            row.sender_domain, row.relationship_type, row.source,
        );
    }
    Ok(())
}

fn run_stats(config: &Config, args: StatsArgs) -> Result<(), AppError> {
    let store = open_store(config)?;

    if args.by_esp {
        for (esp, count) in sorted(store.esp_counts()?) {
            println!("{esp:<24} {count}");
        }
        return Ok(());
    }
    if args.by_industry {
        for (industry, count) in sorted(store.industry_counts()?) {
            println!("{industry:<24} {count}");
        }
        return Ok(());
    }
    if args.by_segment {
        let mut counts: std::collections::BTreeMap<String, i64> = std::collections::BTreeMap::new();
        for segment in store.list_segments(None)? {
            *counts
                .entry(format!("{}/{}", segment.segment, segment.sub_segment))
                .or_default() += 1;
        }
        for (segment, count) in counts {
            println!("{segment:<36} {count}");
        }
        return Ok(());
    }
    if args.gem_summary {
        for (gem_type, count) in sorted(store.count_gems_by_type()?) {
            println!("{gem_type:<24} {count}");
        }
        return Ok(());
    }

    for (table, count) in store.table_stats()? {
        println!("{table:<26} {count}");
    }
    Ok(())
}

fn sorted(map: std::collections::HashMap<String, i64>) -> Vec<(String, i64)> {
    let mut rows: Vec<(String, i64)> = map.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    rows
}

fn run_export(config: &Config, args: ExportArgs) -> Result<(), AppError> {
    let store = open_store(config)?;
    let format = match args.format {
        ExportFormatArg::Csv => ExportFormat::Csv,
        ExportFormatArg::Excel => ExportFormat::Excel,
    };

    let written = if args.gems {
        let output = args
            .output
            .unwrap_or_else(|| PathBuf::from("gems_export.csv"));
        export::export_gems(&store, &output)?
    } else if let Some(segment) = &args.segment {
        let output = args
            .output
            .unwrap_or_else(|| PathBuf::from(format!("segment_{segment}.csv")));
        export::export_segment(&store, segment, &output)?
    } else {
        // --all is the default export.
        let output = args
            .output
            .unwrap_or_else(|| PathBuf::from("profiles_export.csv"));
        export::export_profiles(&store, &output, format)?
    };
    println!("Wrote {}", written.display());
    Ok(())
}

fn run_db(config: &Config, args: DbArgs) -> Result<(), AppError> {
    if args.reset {
        Store::reset(&config.storage.sqlite_path)?;
        println!("Database reset at {}", config.storage.sqlite_path.display());
        return Ok(());
    }
    let store = open_store(config)?;
    if args.migrate {
        let applied = store.migrate()?;
        if applied.is_empty() {
            println!("Schema up to date");
        } else {
            for action in applied {
                println!("{action}");
            }
        }
        return Ok(());
    }
    let _ = args.stats;
    for (table, count) in store.table_stats()? {
        println!("{table:<26} {count}");
    }
    Ok(())
}

async fn run_full(config: &Config, args: RunArgs) -> Result<(), AppError> {
    reject_crew(args.crew)?;
    run_ingest(
        config,
        IngestArgs {
            query: args.query,
            sync: false,
            append: false,
        },
    )
    .await?;

    let services = Arc::new(Services::from_config(config.clone()));
    let orchestrator = Arc::new(Orchestrator::new(services, "cli"));
    if args.all_stages {
        let run_ids = orchestrator.run_all(RunOptions::default()).await?;
        println!("Completed {} stage run(s)", run_ids.len());
    } else {
        for stage in ["metadata", "content", "entities"] {
            orchestrator.run_stage(stage, RunOptions::default()).await?;
        }
        println!("Parsed metadata, content, and entities; run `classify` next");
    }
    Ok(())
}

async fn run_web(mut config: Config, args: WebArgs) -> Result<(), AppError> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.reload {
        tracing::info!("--reload has no effect in this build");
    }
    let services = Arc::new(Services::from_config(config));
    server::serve(services).await?;
    Ok(())
}

fn make_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {pos} seen {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb
}
