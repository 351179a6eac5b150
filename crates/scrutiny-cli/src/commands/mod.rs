//! Command handlers for everything that needs a server connection.

pub mod catalog;
pub mod config_cmd;
pub mod link;
pub mod stats;
pub mod status;
pub mod watch;
pub mod write;

use scrutiny_core::Client;

use crate::cli::{Command, GlobalOpts};
use crate::config::Resolved;
use crate::error::CliError;

pub async fn dispatch(
    cmd: Command,
    client: &Client,
    global: &GlobalOpts,
    resolved: &Resolved,
) -> Result<(), CliError> {
    match cmd {
        Command::Status(args) => status::handle(client, args, global).await,
        Command::Stats(args) => stats::handle(client, args, global).await,
        Command::Watch(args) => watch::handle(client, args, global).await,
        Command::Write(args) => write::handle(client, args, global).await,
        Command::List(args) => catalog::handle_list(client, args, global).await,
        Command::Device => catalog::handle_device(client, global).await,
        Command::Sfd => catalog::handle_sfd(client, global).await,
        Command::Link(args) => link::handle(client, args, global, resolved).await,
        Command::Config(_) | Command::Completions(_) => Err(CliError::Internal(
            "offline command routed to a connected handler".into(),
        )),
    }
}
