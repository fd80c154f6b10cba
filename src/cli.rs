use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "trove")]
#[command(author, version, about = "Discover media across ranked, pluggable sources")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the registered metadata keys
    Keys,

    /// List sources by rank with the operations they support
    Sources,

    /// Show the operations, keys and caps of one source
    Inspect {
        /// Source id
        source: String,
    },

    /// List the children of a container (the source root by default)
    Browse {
        /// Source id
        source: String,

        /// Container id
        container: Option<String>,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Search one or more sources for text
    Search {
        /// Restrict the search to these sources (repeatable); all by default
        #[arg(short, long = "source")]
        sources: Vec<String>,

        /// Text to search for
        text: Option<String>,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Run a source-specific query
    Query {
        /// Source id
        source: String,

        /// Query string, e.g. "artist=Coltrane"
        query_string: String,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Fill in metadata for one media item
    Resolve {
        /// Source id
        source: String,

        /// Media id within the source
        media_id: String,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Validate the configuration and try to create every source
    CheckConfig,
}

/// Options shared by the result-producing commands.
#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// Number of results to skip
    #[arg(long, default_value_t = 0)]
    pub skip: u32,

    /// Maximum number of results
    #[arg(long)]
    pub count: Option<u32>,

    /// Comma-separated key names to fetch
    #[arg(short, long, value_delimiter = ',', default_value = "title,url")]
    pub keys: Vec<String>,

    /// Only return these media types (comma-separated)
    #[arg(short = 't', long = "type", value_delimiter = ',')]
    pub types: Vec<MediaTypeArg>,

    /// Resolve missing keys through other sources
    #[arg(long)]
    pub full: bool,

    /// Skip keys that are slow to compute
    #[arg(long)]
    pub fast_only: bool,

    /// How to treat options a source cannot honour
    #[arg(long, value_enum, default_value_t = NegotiationArg::Emulate)]
    pub negotiation: NegotiationArg,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTypeArg {
    Audio,
    Video,
    Image,
    Container,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationArg {
    /// Fail when the source cannot honour an option
    Strict,
    /// Drop options the source cannot honour
    Partial,
    /// Apply unsupported options locally
    Emulate,
}
