// Utility modules for common functionality
pub mod logger;
pub mod netns;
pub mod sysctl;
