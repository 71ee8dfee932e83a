//! Shared utilities

pub mod lock;
pub mod logging;
pub mod process;
pub mod signal;
pub mod throttle;

pub use lock::InstanceLock;
pub use logging::{init_logging, LogLevel};
pub use process::{ProcessControl, SystemProcessControl};
pub use signal::{cancel_on_shutdown, shutdown_signal};
pub use throttle::LogThrottler;
