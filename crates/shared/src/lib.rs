pub mod domain;
pub mod error;
pub mod frame;
pub mod path;
pub mod protocol;
pub mod reducer;

pub use frame::{Frame, FrameScheduler, FrameStage};
pub use path::{build_reveal_path, build_scan_path, index_at_elapsed, RevealPath, ScanPath};
pub use reducer::{apply_event, create_initial_state, replay, DrawState};
