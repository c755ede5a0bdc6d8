mod isolate;
mod pool;

pub use isolate::{Meta, RunReport, box_dir, run_in_box};
pub use pool::{BoxLease, BoxPool};
