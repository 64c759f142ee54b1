//! Scheduler module
//!
//! Chunk placement, migration and node departure handling

mod departure;
mod migration;
mod placement;

pub use departure::{
    DepartureConfig, DepartureHandler, DepartureOutcome, RecoveryHandle, RecoveryReport,
};
pub use migration::{
    CancelOutcome, MigrationCoordinator, MigrationManager, MigrationStatus, MigrationTask,
};
pub use placement::{PlacementEngine, PlacementStrategy};
