//! Preprocessing analyzers working on top of the history buffer.

pub mod bot;
pub mod clustering;
pub mod quartiles;
