pub mod process;
pub mod proctree;
pub mod registry;

pub use process::{CliProcess, Phase, ProcessEvent, ProcessStatus, ResumeMode, SpawnOptions};
pub use registry::{EntryKey, ProcessRegistry};
