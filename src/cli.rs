//! Command-line surface — section 6. Deliberately thin: a config path and an
//! admin-listen override. Grounded on the teacher's `cli.rs`, with the
//! daemon/direct/status/stop subcommands dropped — there's no daemon in this
//! design, only a single long-running process per section 2's component list.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "aggrogate", version, about = "Aggregating gateway for tool-invocation backends")]
pub struct Cli {
    /// Path to the desired-state configuration file. Falls back to
    /// `MCP_BACKENDS_CONFIG` (section 6 "environment overrides") when the
    /// flag isn't given.
    #[arg(short, long, default_value = "config/gateway.yaml", env = "MCP_BACKENDS_CONFIG")]
    pub config: PathBuf,

    /// Override the admin surface's bind address (default: config file's
    /// `admin_listen`, or disabled if neither is set).
    #[arg(long)]
    pub admin_listen: Option<String>,
}
