//! Pipeline-parallel microbatch scheduling.

pub mod clock;
pub mod comm;
pub mod schedule;
pub mod stage;

pub use clock::{Phases, PipelineAction, PipelineClock};
pub use comm::{activation_tag, recv_activations, send_activations};
pub use schedule::{ScheduleArgs, ScheduleOutput, ScheduleStats, ScheduleStrategy, StepShapes};
pub use stage::{ActivationStash, PipelineStageModel};
