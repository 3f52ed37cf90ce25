mod scheduler;

pub use scheduler::{
    AlwaysMet, BatchOutcome, KeyRotationScheduler, RotationConfig, RotationConstraints, RotationHandle,
};
