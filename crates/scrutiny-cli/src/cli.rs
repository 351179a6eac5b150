//! Clap derive structures for the `scrutiny` CLI.
//!
//! Defines the command tree, global flags, and the argument parsers that
//! reject bad input before a connection is opened.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use scrutiny_core::{DeviceLinkConfig, WatchableListFilter, WatchableType, WriteValue};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// scrutiny -- talk to a Scrutiny debugging server
#[derive(Debug, Parser)]
#[command(
    name = "scrutiny",
    version,
    about = "Inspect and drive embedded targets through a Scrutiny server",
    long_about = "Command-line client for a Scrutiny server.\n\n\
        Reads and writes aliases, variables and runtime published values of the\n\
        device the server is attached to, and configures the server's device link.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Server profile to use
    #[arg(long, short = 'p', env = "SCRUTINY_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "SCRUTINY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Server host (overrides profile)
    #[arg(long, short = 'H', env = "SCRUTINY_HOST", global = true)]
    pub host: Option<String>,

    /// Server port (overrides profile)
    #[arg(long, short = 'P', env = "SCRUTINY_PORT", global = true)]
    pub port: Option<u16>,

    /// Socket kind (overrides profile)
    #[arg(long, value_enum, global = true)]
    pub transport: Option<TransportArg>,

    /// Request timeout, e.g. "4s" or "500ms" (overrides profile)
    #[arg(long, env = "SCRUTINY_TIMEOUT", value_parser = humantime::parse_duration, global = true)]
    pub timeout: Option<Duration>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "SCRUTINY_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TransportArg {
    Tcp,
    Udp,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show server and device status
    #[command(alias = "st")]
    Status(StatusArgs),

    /// Query server and client statistics
    Stats(StatsArgs),

    /// Read watchables once, or follow their updates
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Write one or more watchables as a single batch
    Write(WriteArgs),

    /// List the watchables the server can serve
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show the parameters of the connected device
    Device,

    /// List firmware descriptions installed on the server
    Sfd,

    /// Show or change the server's device link
    Link(LinkArgs),

    /// Manage CLI configuration and profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  STATUS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Wait up to this long for the device to become ready, e.g. "10s"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub wait_device: Option<Duration>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  STATS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[command(subcommand)]
    pub command: StatsCommand,
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    /// Server-side counters and data rates
    Server,

    /// Number of watchables the server knows, per type
    Count,

    /// Traffic and latency of this client's connection
    Local,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  WATCH
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Watchable paths, e.g. /alias/speed /var/main.c/counter
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<String>,

    /// Print every update until interrupted
    #[arg(long, short = 'f')]
    pub follow: bool,

    /// Stop following after this many updates
    #[arg(long, short = 'n', requires = "follow")]
    pub count: Option<usize>,

    /// How long to wait for the first value of every path
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub wait: Duration,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  WRITE
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One `path=value` argument.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub path: String,
    pub raw: String,
    pub value: WriteValue,
}

#[derive(Debug, Args)]
pub struct WriteArgs {
    /// Assignments applied in order: PATH=VALUE. A VALUE naming an enum
    /// member writes that member; anything that isn't a number or a boolean
    /// is evaluated by the server as an expression (e.g. "x+1").
    #[arg(required = true, num_args = 1.., value_parser = parse_assignment)]
    pub assignments: Vec<Assignment>,

    /// How long to wait for the device to confirm the whole batch
    #[arg(long, value_parser = humantime::parse_duration)]
    pub write_timeout: Option<Duration>,
}

pub fn parse_assignment(input: &str) -> Result<Assignment, String> {
    let (path, raw) = input
        .split_once('=')
        .ok_or_else(|| format!("expected PATH=VALUE, got '{input}'"))?;
    let path = path.trim();
    let raw = raw.trim();
    if path.is_empty() {
        return Err(format!("missing path in '{input}'"));
    }
    if raw.is_empty() {
        return Err(format!("missing value for {path}"));
    }
    let value = WriteValue::parse(raw);
    value
        .check()
        .map_err(|e| format!("invalid value for {path}: {e}"))?;
    Ok(Assignment {
        path: path.to_owned(),
        raw: raw.to_owned(),
        value,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  LIST
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only list this type (repeatable)
    #[arg(long = "type", short = 't', value_enum)]
    pub types: Vec<WatchableTypeArg>,

    /// Only list paths matching this glob, e.g. "/var/main.c/*" (repeatable)
    #[arg(long)]
    pub name: Vec<String>,

    /// Watchables per server message
    #[arg(
        long,
        default_value_t = WatchableListFilter::DEFAULT_MAX_PER_RESPONSE,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_per_response: u32,
}

impl ListArgs {
    pub fn filter(&self) -> WatchableListFilter {
        WatchableListFilter {
            types: self.types.iter().map(|&t| t.into()).collect(),
            name_patterns: self.name.clone(),
            max_per_response: self.max_per_response,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WatchableTypeArg {
    Alias,
    Var,
    Rpv,
}

impl From<WatchableTypeArg> for WatchableType {
    fn from(arg: WatchableTypeArg) -> Self {
        match arg {
            WatchableTypeArg::Alias => Self::Alias,
            WatchableTypeArg::Var => Self::Variable,
            WatchableTypeArg::Rpv => Self::RuntimePublishedValue,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  LINK
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct LinkArgs {
    #[command(subcommand)]
    pub command: LinkCommand,
}

#[derive(Debug, Subcommand)]
pub enum LinkCommand {
    /// Show the active device link
    Show,

    /// Switch to the device link stored in the active profile
    Apply,

    /// Switch to a device link given as JSON, e.g.
    /// '{"type":"udp","host":"192.168.1.50","port":8888}'
    Set {
        #[arg(value_parser = parse_link_json)]
        link: DeviceLinkConfig,
    },

    /// Detach the server from any device
    Disable,
}

pub fn parse_link_json(input: &str) -> Result<DeviceLinkConfig, String> {
    let link: DeviceLinkConfig =
        serde_json::from_str(input).map_err(|e| format!("invalid link JSON: {e}"))?;
    link.validate().map_err(|e| e.to_string())?;
    Ok(link)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CONFIG
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Create a config file with one profile
    Init {
        /// Profile name
        #[arg(long, default_value = "default")]
        name: String,

        /// Server host stored in the profile
        #[arg(long = "server-host", default_value = "localhost")]
        server_host: String,

        /// Server port stored in the profile
        #[arg(long = "server-port")]
        server_port: Option<u16>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Display current resolved configuration
    Show,

    /// List configured profiles
    Profiles,

    /// Set the default profile
    Use {
        /// Profile name to set as default
        name: String,
    },

    /// Print the config file location
    Path,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  COMPLETIONS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn assignment_splits_on_first_equals() {
        let a = parse_assignment("/alias/x = 2^(1+1)==4").unwrap_err();
        assert!(a.contains("/alias/x"), "{a}");

        let a = parse_assignment("/alias/x = floor(2.5)*2").unwrap();
        assert_eq!(a.path, "/alias/x");
        assert_eq!(a.raw, "floor(2.5)*2");
        assert_eq!(a.value, WriteValue::Expression("floor(2.5)*2".into()));

        let a = parse_assignment("/rpv/x1000=42").unwrap();
        assert_eq!(a.value, WriteValue::Int(42));
    }

    #[test]
    fn assignment_requires_both_sides() {
        assert!(parse_assignment("/alias/x").is_err());
        assert!(parse_assignment("=3").is_err());
        assert!(parse_assignment("/alias/x=").is_err());
    }

    #[test]
    fn assignment_expressions_are_checked_before_connecting() {
        assert!(parse_assignment("/alias/x=1/0").is_err());
        assert!(parse_assignment("/alias/x=sin(1,2)").is_err());
        assert!(parse_assignment("/alias/x=(((1)").is_err());
        // Bare names may be enum members, resolved once the handle is known.
        let a = parse_assignment("/alias/mode=RUN").unwrap();
        assert_eq!(a.value, WriteValue::Expression("RUN".into()));
    }

    #[test]
    fn list_options_build_the_filter() {
        let cli = Cli::try_parse_from([
            "scrutiny", "list", "-t", "rpv", "--type", "alias", "--name", "/alias/m*",
        ])
        .unwrap();
        let Command::List(args) = cli.command else {
            panic!("expected list, got {:?}", cli.command);
        };
        let filter = args.filter();
        assert_eq!(
            filter.types,
            [WatchableType::RuntimePublishedValue, WatchableType::Alias]
        );
        assert_eq!(filter.name_patterns, ["/alias/m*"]);
        assert_eq!(filter.max_per_response, WatchableListFilter::DEFAULT_MAX_PER_RESPONSE);

        assert!(Cli::try_parse_from(["scrutiny", "list", "--max-per-response", "0"]).is_err());
    }

    #[test]
    fn link_json_is_validated_locally() {
        let link = parse_link_json(r#"{"type":"tcp","host":"10.0.0.2","port":8765}"#).unwrap();
        assert_eq!(link.link_type(), "tcp");

        assert!(parse_link_json(r#"{"type":"tcp","host":"","port":8765}"#).is_err());
        assert!(parse_link_json(r#"{"type":"carrier-pigeon"}"#).is_err());
        assert!(parse_link_json("not json").is_err());
    }

    #[test]
    fn command_tree_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
