//! Terminal chat loop: reads lines, dispatches slash commands, renders replies.

use std::io::Write;

use console::style;
use rustyline_async::SharedWriter;
use tinychat_llm::ChatModel;
use tinychat_storage::Storage;

use crate::app::{AppError, AppResult, ChatController};

use super::EXAMPLE_PROMPTS;
use super::clipboard::copy_to_clipboard;
use super::commands::{self, ChatCommand};
use super::input::{ChatInput, InputEvent};
use super::view::{
    render_conversation, render_message, render_search_results, render_sidebar, unix_now_millis,
};

// Output is best effort, like `println!`, but goes through the prompt-aware writer.
macro_rules! say {
    ($out:expr) => {{
        let _ = writeln!($out);
    }};
    ($out:expr, $($arg:tt)*) => {{
        let _ = writeln!($out, $($arg)*);
    }};
}

enum Flow {
    Continue,
    Quit,
}

struct Terminal {
    input: ChatInput,
    out: SharedWriter,
}

impl Terminal {
    fn show(&mut self) {
        self.input.flush();
    }
}

pub async fn run_chat_loop<S, M>(controller: &mut ChatController<S, M>) -> AppResult<()>
where
    S: Storage,
    M: ChatModel + ?Sized,
{
    let prompt = format!("  {} ", style("You >").green().bold());
    let (input, out) = ChatInput::new(prompt).map_err(|source| AppError::Input {
        stage: "chat-loop-init-readline",
        source: std::io::Error::other(source.to_string()),
    })?;
    let mut terminal = Terminal { input, out };

    print_banner(&mut terminal.out, controller);

    loop {
        let event = terminal
            .input
            .read_line()
            .await
            .map_err(|source| AppError::Input {
                stage: "chat-loop-read-line",
                source: std::io::Error::other(source.to_string()),
            })?;

        let line = match event {
            InputEvent::Eof => {
                say!(terminal.out, "\n  {}", style("Bye.").dim());
                terminal.show();
                return Ok(());
            }
            InputEvent::Interrupted => {
                say!(
                    terminal.out,
                    "  {}",
                    style("Line dropped. Press Ctrl+D to exit, or keep chatting.").dim()
                );
                continue;
            }
            InputEvent::Line(line) => line,
        };

        let result = match commands::parse(&line) {
            Some(command) => handle_command(&mut terminal, controller, command).await,
            None => send_and_render(&mut terminal, controller, &line)
                .await
                .map(|()| Flow::Continue),
        };

        match result {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => {
                say!(terminal.out, "  {}", style("Bye.").dim());
                terminal.show();
                return Ok(());
            }
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => print_error(&mut terminal.out, &error),
        }
    }
}

async fn handle_command<S, M>(
    terminal: &mut Terminal,
    controller: &mut ChatController<S, M>,
    command: ChatCommand,
) -> AppResult<Flow>
where
    S: Storage,
    M: ChatModel + ?Sized,
{
    let out = &mut terminal.out;
    match command {
        ChatCommand::Help => {
            let _ = commands::write_help(out);
        }
        ChatCommand::Quit => return Ok(Flow::Quit),
        ChatCommand::New => {
            controller.new_chat()?;
            say!(out, "\n  {}\n", style("Started a new chat.").green());
            print_example_prompts(out);
        }
        ChatCommand::Clear => match controller.clear_chat()? {
            Some(_) => say!(out, "\n  {}\n", style("Chat and its history deleted.").green()),
            None => say!(out, "\n  {}\n", style("No open chat to clear.").dim()),
        },
        ChatCommand::Sessions => {
            let sessions = controller.sessions()?;
            say!(
                out,
                "\n{}\n",
                render_sidebar(&sessions, controller.current_session(), unix_now_millis())
            );
        }
        ChatCommand::Open(position) => {
            let session = controller.session_at(position)?;
            let messages = controller.open_session(session.id)?;
            say!(out, "\n  {}\n", style(session.display_title()).bold());
            say!(out, "{}\n", render_conversation(&messages));
        }
        ChatCommand::Delete(position) => {
            let session = controller.session_at(position)?;
            controller.delete(session.id)?;
            say!(
                out,
                "\n  {} {}\n",
                style("Deleted").green(),
                session.display_title()
            );
        }
        ChatCommand::Copy(position) => {
            let message = controller.message(position)?;
            if let Err(error) = copy_to_clipboard(out, &message.content) {
                tracing::warn!(error = %error, "failed to write clipboard escape");
            }
            say!(out, "\n  {}", style("Copied to clipboard:").green());
            say!(out, "{}\n", render_message(position, &message));
        }
        ChatCommand::History => {
            let messages = controller.current_messages()?;
            say!(out, "\n{}\n", render_conversation(&messages));
        }
        ChatCommand::Search(query) => {
            let results = controller.search(&query)?;
            say!(out, "\n{}\n", render_search_results(&query, &results));
        }
        ChatCommand::Try(position) => match EXAMPLE_PROMPTS.get(position - 1) {
            Some(prompt) => {
                say!(out, "  {} {}", style("You >").green().bold(), prompt);
                send_and_render(terminal, controller, prompt).await?;
            }
            None => say!(
                out,
                "\n  {} there are {} example prompts\n",
                style("?").yellow().bold(),
                EXAMPLE_PROMPTS.len()
            ),
        },
        ChatCommand::Models => {
            terminal.show();
            let catalog = controller.models().await?;
            let selected = controller.settings().model.clone();
            let out = &mut terminal.out;
            say!(
                out,
                "\n  {} {}",
                style("Models").bold(),
                style(format!("(from {})", catalog.source.label())).dim()
            );
            if let Some(warning) = &catalog.warning {
                say!(out, "  {}", style(format!("endpoint unavailable: {warning}")).yellow());
            }
            for model in &catalog.models {
                let marker = if model.id == selected { "*" } else { " " };
                match &model.description {
                    Some(description) => {
                        say!(out, "  {marker} {} {}", model.id, style(description).dim());
                    }
                    None => say!(out, "  {marker} {}", model.id),
                }
            }
            say!(out);
        }
        ChatCommand::Model(model_id) => {
            controller.select_model(&model_id)?;
            say!(
                out,
                "\n  {} {}\n",
                style("Using model").green(),
                style(controller.settings().model.as_str()).bold()
            );
        }
        ChatCommand::Invalid(message) => {
            say!(out, "\n  {} {}\n", style("?").yellow().bold(), message);
        }
    }

    Ok(Flow::Continue)
}

async fn send_and_render<S, M>(
    terminal: &mut Terminal,
    controller: &mut ChatController<S, M>,
    text: &str,
) -> AppResult<()>
where
    S: Storage,
    M: ChatModel + ?Sized,
{
    if text.trim().is_empty() {
        return Ok(());
    }

    say!(terminal.out, "  {}", style("thinking...").dim());
    // The writer only drains while the prompt is polled, so push this out before waiting.
    terminal.show();

    if let Some(exchange) = controller.send(text).await? {
        let position = usize::try_from(exchange.assistant.seq).unwrap_or(usize::MAX);
        say!(terminal.out, "\n{}\n", render_message(position, &exchange.assistant));
    }
    Ok(())
}

fn print_banner<S, M>(out: &mut SharedWriter, controller: &ChatController<S, M>)
where
    S: Storage,
    M: ChatModel + ?Sized,
{
    let settings = controller.settings();
    say!(out);
    say!(out, "  {}", style("tinychat").cyan().bold());
    say!(
        out,
        "  {}",
        style(format!("model {} at {}", settings.model, settings.endpoint)).dim()
    );
    say!(out, "  {}", style("Type /help for commands.").dim());
    say!(out);
    print_example_prompts(out);
}

fn print_example_prompts(out: &mut SharedWriter) {
    say!(out, "  {}", style("Try one of these (/try <n>):").bold());
    for (index, prompt) in EXAMPLE_PROMPTS.iter().enumerate() {
        say!(out, "  {} {}", style(format!("{}.", index + 1)).dim(), prompt);
    }
    say!(out);
}

fn print_error(out: &mut SharedWriter, error: &AppError) {
    let hint = if error.is_not_found() {
        " (it may have been deleted; see /sessions)"
    } else {
        ""
    };
    say!(out, "\n  {} {error}{hint}\n", style("!").red().bold());
}
