mod orchestrator;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod types;

#[cfg(test)]
mod tests;

pub use orchestrator::Supervisor;
pub use types::{ShutdownReason, StartupReport, StartupState, StatusSnapshot};
