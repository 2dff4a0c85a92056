//! Service layer for coordination logic

pub mod broadcast;
pub mod clarification;
pub mod heartbeat;
pub mod lock;
pub mod registry;
pub mod work_store;

pub use broadcast::{BroadcastLog, BroadcastPage};
pub use clarification::ClarificationChannel;
pub use heartbeat::{HeartbeatMonitor, SweepReport};
pub use lock::{LockManager, ReleaseOutcome};
pub use registry::{AgentRegistry, DeathRecord};
pub use work_store::{WorkStats, WorkStore};
