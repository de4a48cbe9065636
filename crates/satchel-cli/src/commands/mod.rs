pub mod common;
pub mod completions;
pub mod log;
pub mod probe;
pub mod queue;
pub mod seed;
pub mod status;
pub mod sync;
