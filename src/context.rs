//! Session context: who the service acts for. Built once at startup and passed
//! explicitly to everything that needs the current user or role.

use crate::models::meter::Device;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other} (expected user or admin)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
    pub role: Role,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        SessionContext {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins manage every device; users only their own.
    pub fn can_manage(&self, device: &Device) -> bool {
        self.is_admin() || device.user_id == self.user_id
    }
}
