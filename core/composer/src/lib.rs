pub mod composer;
pub mod updater;

pub use composer::{ComposeError, SummaryComposer};
pub use updater::{CycleMode, CycleReport, UpdateOrchestrator};
