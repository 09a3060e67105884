//! Process level helpers.

pub mod logging;
