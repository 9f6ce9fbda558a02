//! Line editing and history for the chat prompt, on top of `rustyline_async`.

use rustyline_async::{Readline, ReadlineError, ReadlineEvent, SharedWriter};

#[derive(Debug, PartialEq, Eq)]
pub enum InputEvent {
    /// A submitted line, trimmed.
    Line(String),
    /// Ctrl+D, or stdin closed.
    Eof,
    /// Ctrl+C: drops the line being typed.
    Interrupted,
}

pub struct ChatInput {
    readline: Readline,
}

impl ChatInput {
    /// Returns the input handle and a writer that prints above the prompt without garbling it.
    pub fn new(prompt: String) -> Result<(Self, SharedWriter), ReadlineError> {
        let (readline, writer) = Readline::new(prompt)?;
        Ok((Self { readline }, writer))
    }

    pub async fn read_line(&mut self) -> Result<InputEvent, ReadlineError> {
        let event = classify(self.readline.readline().await)?;
        if let InputEvent::Line(line) = &event
            && !line.is_empty()
        {
            self.readline.add_history_entry(line.clone());
        }
        Ok(event)
    }

    /// Drains anything still queued on the shared writer.
    pub fn flush(&mut self) {
        let _ = self.readline.flush();
    }
}

fn classify(
    result: Result<ReadlineEvent, ReadlineError>,
) -> Result<InputEvent, ReadlineError> {
    match result {
        Ok(ReadlineEvent::Line(line)) => Ok(InputEvent::Line(line.trim().to_string())),
        Ok(ReadlineEvent::Eof) => Ok(InputEvent::Eof),
        Ok(ReadlineEvent::Interrupted) => Ok(InputEvent::Interrupted),
        Err(ReadlineError::Closed) => Ok(InputEvent::Eof),
        Err(error) => Err(error),
    }
}
