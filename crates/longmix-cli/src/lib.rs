//! Library half of the `longmix` command-line tool.

pub mod logging;
pub mod pipeline;
