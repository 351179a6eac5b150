//! Write command: every assignment goes out in one batch.

use scrutiny_core::{Client, MAX_BATCH_SIZE, WatchableHandle};

use crate::cli::{Assignment, GlobalOpts, WriteArgs};
use crate::error::CliError;

/// Watch every distinct path once, keeping assignment order.
async fn resolve_handles(
    client: &Client,
    assignments: &[Assignment],
) -> Result<Vec<WatchableHandle>, CliError> {
    let mut handles = Vec::with_capacity(assignments.len());
    for a in assignments {
        handles.push(client.watch(&a.path).await?);
    }
    Ok(handles)
}

/// An assignment naming a member of the handle's enum writes that member.
fn is_enum_member(handle: &WatchableHandle, raw: &str) -> bool {
    handle
        .enum_definition()
        .is_some_and(|def| def.value_of(raw).is_some())
}

pub async fn handle(client: &Client, args: WriteArgs, global: &GlobalOpts) -> Result<(), CliError> {
    if args.assignments.len() > MAX_BATCH_SIZE {
        return Err(CliError::Validation {
            field: "assignments".into(),
            reason: format!(
                "{} assignments given, a batch holds at most {MAX_BATCH_SIZE}",
                args.assignments.len()
            ),
        });
    }

    let handles = resolve_handles(client, &args.assignments).await?;
    let timeout = args
        .write_timeout
        .unwrap_or(client.config().write_timeout);

    client
        .batch_write(timeout, |batch| {
            for (a, handle) in args.assignments.iter().zip(&handles) {
                if is_enum_member(handle, &a.raw) {
                    batch.write_enum(handle, &a.raw)?;
                } else {
                    batch.write(handle, a.value.clone())?;
                }
            }
            Ok(())
        })
        .await?;

    tracing::info!(count = args.assignments.len(), "batch confirmed");
    if !global.quiet {
        eprintln!("Wrote {} value(s)", args.assignments.len());
    }
    Ok(())
}
