pub mod engine;
pub mod frame;
pub mod write_queue;

pub use engine::{MuxSession, SessionStats};
