//! Utils module - logging, atomic file writes, string helpers

pub mod fs;
pub mod logging;
pub mod string;
