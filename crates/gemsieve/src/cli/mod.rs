//! Top-level CLI: one subcommand multiplexer over the pipeline, the store,
//! and the admin server.

use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "gemsieve",
    version,
    author,
    about = "Mine your mailbox for latent commercial opportunities"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
    /// Explicit config file path (overrides discovery).
    #[arg(global = true, long = "config")]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Pull messages from the mail provider into the store.
    Ingest(IngestArgs),
    /// Run one parsing stage (metadata, content, or entities).
    Parse(ParseArgs),
    /// Classify senders with the configured language model.
    Classify(ClassifyArgs),
    /// Build sender profiles and detect gems.
    Profile,
    /// Browse detected gems.
    Gems(GemsArgs),
    /// Correct a classification field for a sender or message.
    Override(OverrideArgs),
    /// Inspect stored overrides.
    Overrides(OverridesArgs),
    /// Generate engagement drafts for gems.
    Generate(GenerateArgs),
    /// Set the relationship type for a sender.
    Relationship(RelationshipArgs),
    /// List, auto-detect, or import sender relationships.
    Relationships(RelationshipsArgs),
    /// Mailbox and pipeline statistics.
    Stats(StatsArgs),
    /// Export gems, segments, or profiles to CSV/Excel.
    Export(ExportArgs),
    /// Database maintenance.
    Db(DbArgs),
    /// Run the full pipeline (ingest plus the first six stages).
    Run(RunArgs),
    /// Serve the admin portal.
    Web(WebArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Provider search query (defaults to gmail.default_query).
    #[arg(long)]
    pub query: Option<String>,
    /// Incremental sync from the stored history cursor.
    #[arg(long, action = ArgAction::SetTrue)]
    pub sync: bool,
    /// Append to the existing store without consulting the cursor.
    #[arg(long, action = ArgAction::SetTrue)]
    pub append: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ParseStage {
    Metadata,
    Content,
    Entities,
}

impl ParseStage {
    pub fn stage_name(self) -> &'static str {
        match self {
            ParseStage::Metadata => "metadata",
            ParseStage::Content => "content",
            ParseStage::Entities => "entities",
        }
    }
}

#[derive(Debug, Args)]
pub struct ParseArgs {
    /// Which parsing stage to run.
    #[arg(long, value_enum)]
    pub stage: ParseStage,
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    /// Model spec as `provider:name` (e.g. `ollama:mistral-nemo`).
    #[arg(long)]
    pub model: Option<String>,
    /// Messages per provider call batch.
    #[arg(long = "batch-size")]
    pub batch_size: Option<usize>,
    /// Append few-shot correction examples from recent overrides.
    #[arg(long, action = ArgAction::SetTrue)]
    pub retrain: bool,
    /// Multi-agent crew mode (not supported in this build).
    #[arg(long, action = ArgAction::SetTrue)]
    pub crew: bool,
}

#[derive(Debug, Args)]
pub struct GemsArgs {
    /// List all gems (the default action).
    #[arg(long, action = ArgAction::SetTrue)]
    pub list: bool,
    /// Show only the top N gems by score.
    #[arg(long)]
    pub top: Option<usize>,
    /// Filter by gem type.
    #[arg(long = "type")]
    pub gem_type: Option<String>,
    /// Filter by segment membership.
    #[arg(long)]
    pub segment: Option<String>,
    /// Print the structured explanation for one gem.
    #[arg(long)]
    pub explain: Option<i64>,
}

#[derive(Debug, Args)]
pub struct OverrideArgs {
    /// Sender-scope override target (a domain).
    #[arg(long, conflicts_with = "message")]
    pub sender: Option<String>,
    /// Message-scope override target (a message id).
    #[arg(long)]
    pub message: Option<String>,
    /// Classification field to correct.
    #[arg(long)]
    pub field: String,
    /// Corrected value.
    #[arg(long)]
    pub value: String,
}

#[derive(Debug, Args)]
pub struct OverridesArgs {
    /// List stored overrides.
    #[arg(long, action = ArgAction::SetTrue)]
    pub list: bool,
    /// Per-field override-rate statistics.
    #[arg(long, action = ArgAction::SetTrue)]
    pub stats: bool,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Generate for one specific gem (bypasses filters and the daily cap).
    #[arg(long)]
    pub gem: Option<i64>,
    /// Generate for gems routed to this strategy.
    #[arg(long)]
    pub strategy: Option<String>,
    /// Limit a strategy sweep to the top N gems by score.
    #[arg(long, conflicts_with = "all")]
    pub top: Option<usize>,
    /// Sweep every new gem for the strategy.
    #[arg(long, action = ArgAction::SetTrue)]
    pub all: bool,
    /// Multi-agent crew mode (not supported in this build).
    #[arg(long, action = ArgAction::SetTrue)]
    pub crew: bool,
}

#[derive(Debug, Args)]
pub struct RelationshipArgs {
    /// Sender domain.
    #[arg(long)]
    pub sender: String,
    /// Relationship type (e.g. my_vendor, warm_contact, institutional).
    #[arg(long = "type")]
    pub relationship_type: String,
    /// Free-form note stored with the relationship.
    #[arg(long)]
    pub note: Option<String>,
    /// Suppress all gem detection for this sender.
    #[arg(long, action = ArgAction::SetTrue)]
    pub suppress: bool,
}

#[derive(Debug, Args)]
pub struct RelationshipsArgs {
    /// List stored relationships.
    #[arg(long, action = ArgAction::SetTrue)]
    pub list: bool,
    /// Filter the listing by relationship type.
    #[arg(long = "type")]
    pub type_filter: Option<String>,
    /// Propose relationship types from observed signals.
    #[arg(long = "auto-detect", action = ArgAction::SetTrue)]
    pub auto_detect: bool,
    /// Persist confident auto-detections.
    #[arg(long, action = ArgAction::SetTrue, requires = "auto_detect")]
    pub apply: bool,
    /// Bulk-import relationships from a YAML file.
    #[arg(long)]
    pub import: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    /// Profile counts grouped by ESP.
    #[arg(long = "by-esp", action = ArgAction::SetTrue)]
    pub by_esp: bool,
    /// Profile counts grouped by industry.
    #[arg(long = "by-industry", action = ArgAction::SetTrue)]
    pub by_industry: bool,
    /// Segment membership counts.
    #[arg(long = "by-segment", action = ArgAction::SetTrue)]
    pub by_segment: bool,
    /// Gem counts by type.
    #[arg(long = "gem-summary", action = ArgAction::SetTrue)]
    pub gem_summary: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ExportFormatArg {
    Csv,
    Excel,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Export all gems.
    #[arg(long, action = ArgAction::SetTrue)]
    pub gems: bool,
    /// Export all sender profiles.
    #[arg(long, action = ArgAction::SetTrue)]
    pub all: bool,
    /// Export the profiles of one segment.
    #[arg(long)]
    pub segment: Option<String>,
    /// Output format.
    #[arg(long, value_enum, default_value_t = ExportFormatArg::Csv)]
    pub format: ExportFormatArg,
    /// Output path.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DbArgs {
    /// Delete and recreate the database.
    #[arg(long, action = ArgAction::SetTrue)]
    pub reset: bool,
    /// Apply pending schema migrations.
    #[arg(long, action = ArgAction::SetTrue)]
    pub migrate: bool,
    /// Print per-table row counts.
    #[arg(long, action = ArgAction::SetTrue)]
    pub stats: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Provider query for the ingest step.
    #[arg(long)]
    pub query: Option<String>,
    /// Run every analytic stage after ingest (engage excluded).
    #[arg(long = "all-stages", action = ArgAction::SetTrue)]
    pub all_stages: bool,
    /// Multi-agent crew mode (not supported in this build).
    #[arg(long, action = ArgAction::SetTrue)]
    pub crew: bool,
}

#[derive(Debug, Args)]
pub struct WebArgs {
    /// Bind host (defaults to server.host).
    #[arg(long)]
    pub host: Option<String>,
    /// Bind port (defaults to server.port).
    #[arg(long)]
    pub port: Option<u16>,
    /// Hot reload (development convenience; accepted and ignored).
    #[arg(long, action = ArgAction::SetTrue)]
    pub reload: bool,
}
