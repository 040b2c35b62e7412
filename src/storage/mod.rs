//! Storage module
//!
//! The disk side of the engine: the async disk job queue, the LRU pool
//! of open file handles and resume-data (de)serialization.

pub mod disk_io;
pub mod file_pool;
pub mod resume;

// Re-export disk types
pub use disk_io::{DiskBudget, DiskIo, DiskJobResult, StorageKey};

// Re-export file pool types
pub use file_pool::{FilePool, PoolKey};

// Re-export resume types
pub use resume::ResumeData;
