//! # stager-train — The Training Engine
//!
//! Everything that turns the frozen encoder + LSTM head into a trained
//! sleep stager:
//!
//! * **[`Trainer`]** — owns model + optimiser + schedules. One call to
//!   [`Trainer::fit`] runs the full epoch loop: train pass, validation
//!   pass, LR schedule, logging, early stopping, best-state rehydration.
//! * **[`CosineWarmRestarts`]** — cosine decay with doubling restart cycles.
//! * **[`EarlyStopping`]** — patience counter + atomic best-checkpoint commit.
//! * **[`SgdMomentum`]** — SGD with momentum and L2 weight decay.
//! * **[`cross_entropy_label_smoothing`]** — smoothed classification loss.

pub mod loss;
pub mod optim;
pub mod scheduler;
pub mod stopper;
pub mod trainer;

pub use loss::cross_entropy_label_smoothing;
pub use optim::{ParamsSgdMomentum, SgdMomentum};
pub use scheduler::CosineWarmRestarts;
pub use stopper::EarlyStopping;
pub use trainer::{EpochMetrics, ExecutionStrategy, SingleDevice, Trainer, TrainerConfig};
