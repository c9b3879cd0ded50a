pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod listener;
pub mod mission;
pub mod net;
pub mod probe;
pub mod rate;
pub mod registry;
pub mod snapshot;
pub mod volume;
mod worker;


pub use crate::config::EngineConfig;
pub use crate::context::MissionContext;
pub use crate::error::{CoreError, CoreResult, ErrorCode};
pub use crate::listener::{Executor, InlineExecutor, MissionListener, QueueExecutor};
pub use crate::mission::{Mission, MissionId, MissionRecord, MissionStatus};
pub use crate::registry::{MissionKey, MissionRegistry, MissionRequest, RegistryHandle};
