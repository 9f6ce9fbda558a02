/// OSC 52 clipboard writes for Copy Message.
pub mod clipboard;
/// Slash command grammar.
pub mod commands;
pub mod input;
pub mod session_loop;
pub mod view;

pub use commands::ChatCommand;
pub use session_loop::run_chat_loop;

/// Starter prompts offered on an empty chat, sent with `/try <n>`.
pub const EXAMPLE_PROMPTS: [&str; 3] = [
    "Tell me about artificial intelligence",
    "How does machine learning work?",
    "What are neural networks?",
];
