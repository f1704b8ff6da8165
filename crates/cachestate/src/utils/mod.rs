mod defer;

pub use defer::{CallOnDrop, PendingTasks};
