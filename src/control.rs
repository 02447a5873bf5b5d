//! Operator commands, one per line on stdin
//!
//! ```text
//! device <hex>        set the DevEui filter (no argument clears it)
//! router <id>         set the stream-level router filter (no argument clears it)
//! match exact|contains
//! view <substring>    presentation-level router filter (no argument clears it)
//! record start|stop
//! export <path>       write recorded samples as CSV
//! reconnect           reopen the uplink stream
//! status
//! quit
//! ```

use anyhow::{anyhow, bail};
use std::io::BufRead;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::filter::RouterMatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Device(Option<String>),
    Router(Option<String>),
    Match(RouterMatch),
    View(Option<String>),
    RecordStart,
    RecordStop,
    Export(PathBuf),
    Reconnect,
    Status,
    Quit,
}

impl Command {
    /// Filter changes need a fresh stream subscription
    pub fn is_filter_change(&self) -> bool {
        matches!(
            self,
            Command::Device(_) | Command::Router(_) | Command::Match(_)
        )
    }
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, arg) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, Some(rest.trim()).filter(|a| !a.is_empty())),
            None => (line, None),
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "device" => Command::Device(arg.map(str::to_string)),
            "router" => Command::Router(arg.map(str::to_string)),
            "match" => Command::Match(
                arg.ok_or_else(|| anyhow!("usage: match exact|contains"))?
                    .parse()?,
            ),
            "view" => Command::View(arg.map(str::to_string)),
            "record" => match arg.map(str::to_ascii_lowercase).as_deref() {
                Some("start") => Command::RecordStart,
                Some("stop") => Command::RecordStop,
                _ => bail!("usage: record start|stop"),
            },
            "export" => Command::Export(
                arg.map(PathBuf::from)
                    .ok_or_else(|| anyhow!("usage: export <path>"))?,
            ),
            "reconnect" => Command::Reconnect,
            "status" => Command::Status,
            "quit" | "exit" => Command::Quit,
            "" => bail!("empty command"),
            other => bail!("unknown command '{}'", other),
        };
        Ok(command)
    }
}

/// Read commands line by line on a dedicated OS thread.
///
/// Blocking reads stay off the runtime, so a read that never returns does not
/// hold up shutdown. The thread ends at EOF, on a read error, or once the
/// receiver is gone.
pub fn spawn_command_reader<R>(input: R, tx: mpsc::Sender<Command>) -> anyhow::Result<thread::JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    let handle = thread::Builder::new()
        .name("operator-commands".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Failed to read operator input: {}", e);
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => {
                        if tx.blocking_send(command).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("{}", e),
                }
            }
            debug!("Operator input closed, no more commands");
        })?;
    Ok(handle)
}
