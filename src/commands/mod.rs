//! Front-end commands for the terminal chat.
//!
//! - `chat`: terminal renderer and the line REPL
//! - `session`: chat list / new / open / delete and the history view
//! - `settings`: turn settings persisted in the data directory

pub mod chat;
pub mod session;
pub mod settings;
