//! Slash command parsing for the chat loop.

use std::io::{self, Write};

use console::style;

#[derive(Debug, PartialEq, Eq)]
pub enum ChatCommand {
    Help,
    New,
    Clear,
    Sessions,
    /// 1-based position in the session list.
    Open(usize),
    Delete(usize),
    /// 1-based position in the current conversation.
    Copy(usize),
    History,
    Search(String),
    /// Send the n-th example prompt.
    Try(usize),
    Models,
    Model(String),
    Quit,
    /// Unknown command or bad arguments; carries the message to show.
    Invalid(String),
}

/// Returns `None` when the input is a plain message.
pub fn parse(input: &str) -> Option<ChatCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default().to_lowercase();
    let argument = parts.next().map(str::trim).unwrap_or_default();

    let parsed = match command.as_str() {
        "/help" | "/h" | "/?" => ChatCommand::Help,
        "/new" => ChatCommand::New,
        "/clear" => ChatCommand::Clear,
        "/sessions" | "/ls" => ChatCommand::Sessions,
        "/open" => position_argument(argument, "/open").map_or_else(|e| e, ChatCommand::Open),
        "/delete" | "/rm" => {
            position_argument(argument, "/delete").map_or_else(|e| e, ChatCommand::Delete)
        }
        "/copy" => position_argument(argument, "/copy").map_or_else(|e| e, ChatCommand::Copy),
        "/history" => ChatCommand::History,
        "/search" => {
            if argument.is_empty() {
                ChatCommand::Invalid("/search requires a query".to_string())
            } else {
                ChatCommand::Search(argument.to_string())
            }
        }
        "/try" => position_argument(argument, "/try").map_or_else(|e| e, ChatCommand::Try),
        "/models" => ChatCommand::Models,
        "/model" => {
            if argument.is_empty() {
                ChatCommand::Invalid("/model requires a model id".to_string())
            } else {
                ChatCommand::Model(argument.to_string())
            }
        }
        "/quit" | "/exit" | "/q" => ChatCommand::Quit,
        other => ChatCommand::Invalid(format!(
            "unknown command {other}; type /help for available commands"
        )),
    };

    Some(parsed)
}

fn position_argument(argument: &str, command: &str) -> Result<usize, ChatCommand> {
    match argument.parse::<usize>() {
        Ok(position) if position > 0 => Ok(position),
        _ => Err(ChatCommand::Invalid(format!(
            "{command} requires a number from the list, e.g. {command} 1"
        ))),
    }
}

pub fn write_help(out: &mut impl Write) -> io::Result<()> {
    let rows = [
        ("/new", "Start a new chat"),
        ("/clear", "Delete the current chat and its history"),
        ("/sessions", "List saved chats"),
        ("/open <n>", "Open chat n from /sessions"),
        ("/delete <n>", "Delete chat n from /sessions"),
        ("/history", "Show the current conversation"),
        ("/copy <n>", "Copy message n to the clipboard"),
        ("/search <q>", "Search all saved messages"),
        ("/try <n>", "Send example prompt n"),
        ("/models", "List models served by the endpoint"),
        ("/model <id>", "Switch model"),
        ("/help", "Show this help message"),
        ("/quit", "Exit"),
    ];

    writeln!(out)?;
    writeln!(out, "  {}", style("Available commands:").bold())?;
    writeln!(out)?;
    for (command, description) in rows {
        writeln!(out, "  {:<14}{}", style(command).cyan(), description)?;
    }
    writeln!(out)?;
    writeln!(
        out,
        "  {}",
        style("Anything else is sent to the model. Ctrl+C drops the line, Ctrl+D exits.").dim()
    )?;
    writeln!(out)
}
