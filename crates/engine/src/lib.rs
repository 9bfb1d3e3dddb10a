pub mod completion;
pub mod mentions;
pub mod reactions;
pub mod watcher;
