//! Console commands.

use std::str::FromStr;

use kiip_core::ActivityRank;
use thiserror::Error;

/// One line typed on the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask for a login code mailed to the address.
    Login(String),
    /// Submit the mailed code.
    Code(String),
    /// Report a new activity rank to the election.
    Activity(ActivityRank),
    /// Print connectivity, authentication and leadership.
    State,
    /// List the commands.
    Help,
    /// Shut down.
    Quit,
}

/// Unparseable console line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Nothing but whitespace.
    #[error("empty command")]
    Empty,
    /// First word is not a command.
    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),
    /// Command needs an argument.
    #[error("usage: {0}")]
    MissingArgument(&'static str),
    /// Command takes no argument, or fewer than were given.
    #[error("unexpected argument {0:?}")]
    UnexpectedArgument(String),
}

/// Usage summary printed by `help`.
pub const HELP: &str = "\
login <email>  request a login code
code <code>    submit the login code
focus          this instance is focused
blur           this instance is visible but unfocused
hide           this instance is hidden
state          show connection, login and leadership
quit           exit";

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(CommandError::Empty);
        };
        let argument = words.next();
        if let Some(extra) = words.next() {
            return Err(CommandError::UnexpectedArgument(extra.to_owned()));
        }

        let bare = |command: Self| match argument {
            Some(arg) => Err(CommandError::UnexpectedArgument(arg.to_owned())),
            None => Ok(command),
        };

        match name.to_ascii_lowercase().as_str() {
            "login" => argument
                .map(|email| Self::Login(email.to_owned()))
                .ok_or(CommandError::MissingArgument("login <email>")),
            "code" => argument
                .map(|code| Self::Code(code.to_owned()))
                .ok_or(CommandError::MissingArgument("code <code>")),
            "focus" => bare(Self::Activity(ActivityRank::Focused)),
            "blur" => bare(Self::Activity(ActivityRank::Visible)),
            "hide" => bare(Self::Activity(ActivityRank::Hidden)),
            "state" => bare(Self::State),
            "help" | "?" => bare(Self::Help),
            "quit" | "exit" => bare(Self::Quit),
            other => Err(CommandError::Unknown(other.to_owned())),
        }
    }
}
