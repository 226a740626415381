//! Thin per-table query modules.  All SQL lives here; callers never build
//! statements inline.

pub mod bans;
pub mod chatlog;
pub mod users;
