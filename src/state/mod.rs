//! Durable run state.
//!
//! Checkpoints let a graph resume after a crash or a cancelled run without
//! re-executing tasks that already succeeded.

mod checkpoint;

pub use checkpoint::{
    Checkpoint, CheckpointSlot, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    TaskCheckpoint,
};
