// Routines for logging
pub mod logger;
// Routines for the optimization of one record
pub mod optimization;
// Routines for partitioning work across workers
pub mod partition;
// Routines for settings
pub mod settings;
// Routines for persistence
pub mod store;
