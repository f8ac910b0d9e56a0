pub mod attendance;
pub mod backup_exchange;
pub mod core;
pub mod routine;
pub mod schedule;
pub mod setup;
pub mod timeslots;
