pub mod archive;
pub mod error;
pub mod events;
pub mod git;
pub mod gitignore;
pub mod manager;
pub mod poller;
pub mod state;
pub mod store;
pub mod worktrees;

pub use archive::SweepReport;
pub use error::AppError;
pub use events::WorktreeEvent;
pub use gitignore::{ParsedPattern, PatternCategory};
pub use manager::{ManagerConfig, WorktreeManager};
pub use store::types::{ArchivedWorktree, WorktreeMetadata, WorktreeStatus};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Call once from the embedding
/// application; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worktree_manager=info")),
        )
        .init();
}
