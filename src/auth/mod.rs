//! Identity gateway adapter
//!
//! Handles:
//! - Bearer token verification
//! - Authentication middleware and extractors

mod middleware;
pub mod token;

pub use middleware::{CurrentUser, authenticate_token, extract_token_from_headers, require_auth};
pub use token::{Claims, Role, create_access_token, verify_access_token};

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}
