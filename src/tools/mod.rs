//! External tool catalog and verification.

pub mod checker;
pub mod registry;

pub use checker::{
    ToolChecker, ToolState, ToolStatus, VerificationReport, compare_versions, extract_version,
    is_outdated,
};
pub use registry::{ToolCatalog, ToolSpec};
