//! Authentication collaborators

pub mod provider;
pub mod token;

// Re-export main components
pub use provider::{AuthValidator, Identity};
pub use token::{Claims, JwtAuthValidator, TokenManager};
