/// Settings persistence: layered loading and atomic saves.
pub mod state;
