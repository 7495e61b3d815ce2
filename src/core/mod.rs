//! 核心层：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::BridgeError;
pub use shutdown::{
    run_with_graceful_shutdown, CleanupReport, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
