pub mod daemon;
pub mod notify_listener;
pub mod sync;
