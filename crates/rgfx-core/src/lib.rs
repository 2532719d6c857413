pub mod config;
pub mod error;
pub mod handle;
pub mod registry;
pub mod handle_map;
pub mod barrier;
pub mod staging;
pub mod sync;
pub mod batch;
pub mod scheduler;
pub mod context;

pub use barrier::{Barrier, BarrierManager, BarrierRecorder, BarrierSink, DeferredBarrierSet};
pub use batch::{BatchId, BatchState, CmdBatchDesc, SubmitMode};
pub use config::RgfxConfig;
pub use error::GfxError;
pub use handle::Handle;
pub use handle_map::HandleMap;
pub use registry::{HandleRegistry, HandleValidator, StrongHandle};
pub use scheduler::{FrameCompletion, FrameListener, RenderTaskScheduler, SchedulerConfig};
pub use staging::{StagingBufferManager, StagingRange};
pub use sync::{SemaphoreDep, SubmitBackend};
pub use rgfx_protocol::{ContextKind, FrameId, QueueType};
