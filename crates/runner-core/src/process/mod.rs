pub mod supervisor;

pub use supervisor::{run_to_completion, spawn, supervise, Supervised};
