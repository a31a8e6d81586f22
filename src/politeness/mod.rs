pub mod robots;
pub mod throttle;

// Re-export common types
pub use robots::{RobotsPolicy, RobotsPolicyCache};
pub use throttle::{domain_of, DomainThrottle};
