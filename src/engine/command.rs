use anyhow::{anyhow, bail, Result};
use std::str::FromStr;

use crate::models::PositionSide;

pub const HELP: &str = "\
commands:
  start                  set leverage/margin, reconcile, begin trading
  stop                   stop the strategy (only while FLAT)
  open <long|short> [n]  open a position, sized from equity unless n is given
  close                  close the current position
  reconcile              compare with the exchange now
  status                 print the current snapshot
  help                   show this text";

/// One line typed on the operator console
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Open { side: PositionSide, size: Option<f64> },
    Close,
    Status,
    Reconcile,
    Help,
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            bail!("empty command");
        };

        let command = match verb.to_lowercase().as_str() {
            "start" => ConsoleCommand::Start,
            "stop" => ConsoleCommand::Stop,
            "close" | "flat" => ConsoleCommand::Close,
            "status" | "s" => ConsoleCommand::Status,
            "reconcile" | "sync" => ConsoleCommand::Reconcile,
            "help" | "?" => ConsoleCommand::Help,
            "open" | "long" | "short" => {
                let side_word = if verb.eq_ignore_ascii_case("open") {
                    words
                        .next()
                        .ok_or_else(|| anyhow!("open needs a side: long or short"))?
                } else {
                    verb
                };
                let side: PositionSide = side_word.parse().map_err(|e: String| anyhow!(e))?;
                if side == PositionSide::Flat {
                    bail!("open needs a side: long or short");
                }

                let size = match words.next() {
                    Some(raw) => {
                        let size: f64 = raw
                            .parse()
                            .map_err(|_| anyhow!("invalid size '{}'", raw))?;
                        if !(size > 0.0) {
                            bail!("size must be positive, got {}", size);
                        }
                        Some(size)
                    }
                    None => None,
                };
                ConsoleCommand::Open { side, size }
            }
            other => bail!("unknown command '{}', type 'help'", other),
        };

        if let Some(extra) = words.next() {
            bail!("unexpected argument '{}'", extra);
        }
        Ok(command)
    }
}
