pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod projection;
pub mod rate_limit;
pub mod store;
pub mod suggest;
pub mod terminal;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod tree;
pub mod workspace;
pub mod writer;

pub use coordinator::{
    ClientConnection, ClientHandle, Collaborators, CoordinatorConfig, LifecycleCoordinator,
};
pub use error::VboxError;
pub use gateway::{Client, SessionGateway};
pub use identity::{HttpIdentity, IdentityService, UserRecord};
pub use rate_limit::{BucketConfig, OperationKind, RateLimiter};
pub use store::{HttpObjectStore, ObjectStore};
pub use suggest::{HttpSuggestionClient, SuggestionService};
pub use terminal::{PtyLauncher, ShellCommand, ShellLauncher, TerminalMultiplexer};
pub use workspace::{WorkspaceCache, WorkspaceOptions};
