//! Text commands accepted on the control surface
//!
//! One command per line, words separated by whitespace:
//! `sat 0.5`, `saturation -20`, `sharpen 1.5`, `quit`, `help`.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::error::CalibError;
use crate::knobs::RuntimeKnobs;

pub const REPLY_OK: &str = "ok";
pub const REPLY_QUIT: &str = "quitting";
pub const REPLY_UNKNOWN: &str = "command not known - type help for more info";

const HELP: &str = "Available commands:\n\
    sat <value>        add <value> to the saturation channel (0 disables)\n\
    saturation <value> same as sat\n\
    sharpen <value>    unsharp mask amount (0 disables)\n\
    quit               stop the module\n\
    help               this text";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Saturation(f64),
    Sharpen(f64),
    Quit,
    Help,
    Unknown(String),
}

impl Command {
    /// Parse a single command line
    pub fn parse_line(line: &str) -> Result<Self, CalibError> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(Command::Unknown(String::new()));
        };

        let command = match verb {
            "sat" | "saturation" => Command::Saturation(value(verb, words.next())?),
            "sharpen" => Command::Sharpen(value(verb, words.next())?),
            "quit" => Command::Quit,
            "help" => Command::Help,
            other => Command::Unknown(other.to_string()),
        };
        Ok(command)
    }

    /// Carry out the command and return the reply text
    pub fn execute(&self, knobs: &RuntimeKnobs, quit: &AtomicBool) -> &'static str {
        match self {
            Command::Saturation(v) => {
                knobs.set_saturation(*v);
                info!("Saturation set to {}", v);
                REPLY_OK
            }
            Command::Sharpen(v) => {
                knobs.set_sharpen(*v);
                info!("Sharpen set to {}", v);
                REPLY_OK
            }
            Command::Quit => {
                quit.store(true, Ordering::SeqCst);
                REPLY_QUIT
            }
            Command::Help => HELP,
            Command::Unknown(word) => {
                warn!("Unknown command \"{}\"", word);
                REPLY_UNKNOWN
            }
        }
    }
}

fn value(verb: &str, word: Option<&str>) -> Result<f64, CalibError> {
    let word = word.ok_or_else(|| CalibError::InvalidCommand(format!("{} needs a value", verb)))?;
    match word.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(CalibError::InvalidCommand(format!(
            "{}: \"{}\" is not a number",
            verb, word
        ))),
    }
}

/// Parse and execute one line
pub fn handle_line(
    line: &str,
    knobs: &RuntimeKnobs,
    quit: &AtomicBool,
) -> Result<&'static str, CalibError> {
    Ok(Command::parse_line(line)?.execute(knobs, quit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Command::parse_line("sat 0.5").unwrap(), Command::Saturation(0.5));
        assert_eq!(Command::parse_line("  saturation   -20 ").unwrap(), Command::Saturation(-20.0));
        assert_eq!(Command::parse_line("sharpen 2").unwrap(), Command::Sharpen(2.0));
        assert_eq!(Command::parse_line("quit").unwrap(), Command::Quit);
        assert_eq!(Command::parse_line("help").unwrap(), Command::Help);
        assert_eq!(Command::parse_line("zoom 2").unwrap(), Command::Unknown("zoom".into()));
        assert_eq!(Command::parse_line("").unwrap(), Command::Unknown(String::new()));
    }

    #[test]
    fn test_malformed_values() {
        assert!(matches!(Command::parse_line("sat"), Err(CalibError::InvalidCommand(_))));
        assert!(matches!(Command::parse_line("sat high"), Err(CalibError::InvalidCommand(_))));
        assert!(matches!(Command::parse_line("sharpen NaN"), Err(CalibError::InvalidCommand(_))));
    }

    #[test]
    fn test_saturation_updates_knobs() {
        let knobs = RuntimeKnobs::default();
        let quit = AtomicBool::new(false);
        assert_eq!(handle_line("sat 25", &knobs, &quit).unwrap(), REPLY_OK);
        assert_eq!(knobs.snapshot().saturation, 25.0);
        assert_eq!(handle_line("sharpen 0.5", &knobs, &quit).unwrap(), REPLY_OK);
        assert_eq!(knobs.snapshot().sharpen, 0.5);
        assert!(!quit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_quit_sets_flag() {
        let knobs = RuntimeKnobs::default();
        let quit = AtomicBool::new(false);
        assert_eq!(handle_line("quit", &knobs, &quit).unwrap(), REPLY_QUIT);
        assert!(quit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unknown_still_answered() {
        let knobs = RuntimeKnobs::default();
        let quit = AtomicBool::new(false);
        assert_eq!(handle_line("exposure 3", &knobs, &quit).unwrap(), REPLY_UNKNOWN);
        assert!(handle_line("help", &knobs, &quit).unwrap().contains("saturation"));
        assert_eq!(knobs.snapshot(), RuntimeKnobs::default().snapshot());
    }
}
