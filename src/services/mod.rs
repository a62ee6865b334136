pub mod api_client;
pub mod availability;
pub mod bundle_fetcher;
pub mod extraction;
pub mod ledger;
pub mod orchestrator;
pub mod patch_manager;
pub mod payload;
pub mod task_store;
pub mod updater;

pub use api_client::ApiClient;
pub use availability::AvailabilityWatcher;
pub use bundle_fetcher::{ArchiveOrigin, BundleFetcher, FetchedArchive};
pub use extraction::Extractor;
pub use ledger::{Ledger, PendingGames};
pub use orchestrator::Orchestrator;
pub use patch_manager::{ApplyReport, PatchFamily, PatchManager, UndoReport};
pub use task_store::{
    CancelProbe, TaskFamily, TaskKey, TaskKind, TaskState, TaskStatus, TaskStore, TaskStores,
    TaskUpdate,
};
pub use updater::{UpdateLoop, UpdateService};
