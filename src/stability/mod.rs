//! Stability patterns: rate accounting, flood policy, shutdown coordination

pub mod pps_monitor;
pub mod rate_window;
pub mod shutdown;

pub use pps_monitor::{FloodConfig, FloodVerdict, PpsMonitor};
pub use rate_window::{RateWindow, DEFAULT_WINDOW_SECS};
pub use shutdown::{install_signal_handlers, ShutdownCoordinator};
