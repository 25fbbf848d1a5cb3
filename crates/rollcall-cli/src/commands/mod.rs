pub mod common;
pub mod completions;
pub mod errors;
pub mod groups;
pub mod status;
pub mod sync;
pub mod tombstones;
pub mod users;
