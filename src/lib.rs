pub mod chat;
pub mod classifier;
pub mod config;
pub mod gateway;
pub mod reconcile;
pub mod snapshot;
pub mod summary;
pub mod transcript;
pub mod tree;

pub use classifier::{classify, Instruction};
pub use gateway::{GatewayError, GitHubGateway, RepositoryGateway};
pub use reconcile::{reconcile, ReconcileError, Reconciler};
pub use summary::project_summary_only;
pub use tree::{NodeKind, TreeError, TreeNode};
