pub mod backups;
pub mod error;
pub mod executor;
pub mod guards;
pub mod orchestrator;
pub mod registry;
pub mod workspace;

pub use backups::{FileBackupStore, MAX_BACKUPS};
pub use error::EngineError;
pub use executor::{normalize_args, CommandExecutor, DEFAULT_COMMAND_TIMEOUT};
pub use guards::{payload_fingerprint, ExecutionGuard, FingerprintSet, DEDUP_CAPACITY};
pub use orchestrator::{Disposition, DropReason, OrchestratorConfig, Phase, TurnOrchestrator};
pub use registry::CommandRegistry;
pub use workspace::default_registry;
