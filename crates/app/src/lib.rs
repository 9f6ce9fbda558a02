#![deny(unsafe_code)]

/// Chat controller: session bookkeeping around storage and the model.
pub mod app;
/// Terminal chat surface.
pub mod chat;
/// Settings persistence.
pub mod settings;
