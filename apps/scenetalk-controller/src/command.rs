//! Operator commands, from stdin or `--exec`.
//!
//! Two commands exist: `exit` and `resolve <name>-<version>[/<entry_point>]`.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{PackageRef, ResolveRequest};
use crate::work::{CompletionWaiter, QueueClosed, ResolveOutcome, ResolveQueue};

static PACKAGE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z0-9_.-]+)-([0-9]+(?:\.[0-9]+)*(?:[-_][a-zA-Z0-9]+)?)(?:/([a-zA-Z0-9_.-]+))?$")
        .expect("valid package reference pattern")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid package reference '{0}'; use 'package-version/entrypoint'")]
    InvalidPackageRef(String),
    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),
    #[error("invalid command '{0}'; use 'resolve packagename-version' or 'exit'")]
    Unknown(String),
    #[error(transparent)]
    Queue(#[from] QueueClosed),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Resolve(PackageRef),
}

/// `numpy-1.24.3/array_functions` -> name `numpy`, version `1.24.3`,
/// entry point `array_functions`.
pub fn parse_package_ref(text: &str) -> Result<PackageRef, CommandError> {
    let text = text.trim();
    let captures = PACKAGE_REF
        .captures(text)
        .ok_or_else(|| CommandError::InvalidPackageRef(text.to_string()))?;
    let entry_point = captures.get(3).map(|m| m.as_str().to_string());
    Ok(PackageRef::by_name(&captures[1], &captures[2], entry_point))
}

/// Blank lines parse to `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    let mut parts = line.splitn(2, char::is_whitespace);
    let Some(verb) = parts.next().filter(|verb| !verb.is_empty()) else {
        return Ok(None);
    };
    let argument = parts.next().map(str::trim).filter(|arg| !arg.is_empty());
    match verb {
        "exit" => Ok(Some(Command::Exit)),
        "resolve" => {
            let argument = argument.ok_or(CommandError::MissingArgument("resolve"))?;
            Ok(Some(Command::Resolve(parse_package_ref(argument)?)))
        }
        _ => Err(CommandError::Unknown(line.to_string())),
    }
}

/// Applies one command line. A submitted resolve returns its waiter.
pub fn exec_command(
    line: &str,
    jobs: &ResolveQueue,
    shutdown: &CancellationToken,
) -> Result<Option<CompletionWaiter>, CommandError> {
    match parse_command(line)? {
        None => Ok(None),
        Some(Command::Exit) => {
            info!("exit requested");
            shutdown.cancel();
            Ok(None)
        }
        Some(Command::Resolve(package)) => {
            info!(%package, "queueing resolve request");
            let waiter = jobs.submit(ResolveRequest::ForCook(package))?;
            Ok(Some(waiter))
        }
    }
}

pub async fn log_outcome(label: String, waiter: CompletionWaiter) {
    match waiter.wait().await {
        ResolveOutcome::Resolved(path) => {
            info!(request = %label, path = %path.display(), "command resolved")
        }
        ResolveOutcome::Failed(reason) => error!(request = %label, %reason, "command failed"),
        ResolveOutcome::Abandoned => warn!(request = %label, "command abandoned at shutdown"),
    }
}

/// Reads commands line by line until EOF or shutdown. Bad commands are
/// logged and skipped.
pub async fn run_commands<R>(
    reader: R,
    jobs: ResolveQueue,
    shutdown: CancellationToken,
) -> Result<(), CommandError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("command input closed");
                break;
            }
            Err(err) => {
                warn!(error = %err, "failed to read command input");
                break;
            }
        };

        match exec_command(&line, &jobs, &shutdown) {
            Ok(Some(waiter)) => {
                tokio::spawn(log_outcome(line.trim().to_string(), waiter));
            }
            Ok(None) => {}
            Err(CommandError::Queue(err)) => return Err(CommandError::Queue(err)),
            Err(err) => error!(error = %err, "invalid command"),
        }
    }
    Ok(())
}

pub async fn run_stdin(jobs: ResolveQueue, shutdown: CancellationToken) -> Result<(), CommandError> {
    info!("reading commands from stdin");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run_commands(stdin, jobs, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::resolve_queue;

    #[test]
    fn parses_name_version_and_entry_point() {
        let package = parse_package_ref("numpy-1.24.3/array_functions").unwrap();
        assert_eq!(package.package_name.as_deref(), Some("numpy"));
        assert_eq!(package.version, "1.24.3");
        assert_eq!(package.entry_point.as_deref(), Some("array_functions"));
        assert_eq!(package.asset_id, None);
    }

    #[test]
    fn entry_point_is_optional() {
        let package = parse_package_ref("django-4.2.0").unwrap();
        assert_eq!(package.package_name.as_deref(), Some("django"));
        assert_eq!(package.version, "4.2.0");
        assert_eq!(package.entry_point, None);
    }

    #[test]
    fn hyphenated_names_and_suffixed_versions() {
        let package = parse_package_ref("crystal-pack-2.0-rc1").unwrap();
        assert_eq!(package.package_name.as_deref(), Some("crystal-pack"));
        assert_eq!(package.version, "2.0-rc1");
    }

    #[test]
    fn rejects_malformed_reference() {
        assert_eq!(
            parse_package_ref("not a valid ref"),
            Err(CommandError::InvalidPackageRef("not a valid ref".into()))
        );
        assert!(parse_package_ref("numpy").is_err());
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("  "), Ok(None));
        assert_eq!(parse_command("exit"), Ok(Some(Command::Exit)));
        assert_eq!(
            parse_command("resolve"),
            Err(CommandError::MissingArgument("resolve"))
        );
        assert!(matches!(
            parse_command("resolve crystal_pack-1.0/default"),
            Ok(Some(Command::Resolve(_)))
        ));
        assert!(matches!(parse_command("cook now"), Err(CommandError::Unknown(_))));
    }

    #[test]
    fn exit_cancels_shutdown() {
        let (jobs, _rx) = resolve_queue();
        let shutdown = CancellationToken::new();
        assert!(exec_command("exit", &jobs, &shutdown).unwrap().is_none());
        assert!(shutdown.is_cancelled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn command_stream_enqueues_and_survives_bad_lines() {
        let (jobs, mut rx) = resolve_queue();
        let shutdown = CancellationToken::new();
        let input: &[u8] = b"bogus\nresolve not a ref\nresolve crystal_pack-1.0/default\n";

        run_commands(input, jobs, shutdown.clone()).await.unwrap();
        assert!(!shutdown.is_cancelled(), "eof must not stop the controller");

        let job = rx.next(&shutdown).await.unwrap();
        assert_eq!(
            job.request,
            ResolveRequest::ForCook(PackageRef::by_name(
                "crystal_pack",
                "1.0",
                Some("default".into())
            ))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn exit_line_stops_the_reader() {
        let (jobs, _rx) = resolve_queue();
        let shutdown = CancellationToken::new();
        let input: &[u8] = b"exit\nresolve crystal_pack-1.0\n";
        run_commands(input, jobs, shutdown.clone()).await.unwrap();
        assert!(shutdown.is_cancelled());
    }
}
