use crate::error::RoleRejected;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Grid,
    PvInverter,
    Genset,
}

impl Role {
    pub const ALLOWED: [Role; 3] = [Role::Grid, Role::PvInverter, Role::Genset];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Grid => "grid",
            Role::PvInverter => "pvinverter",
            Role::Genset => "genset",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RoleRejected;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALLOWED
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| RoleRejected(s.to_string()))
    }
}

/// The "role:instance" identity of the published service.
///
/// Role writes arrive on the bus binding's task while the poll loop runs on
/// its own, so the pair lives behind a small lock.
#[derive(Debug)]
pub struct DeviceIdentity {
    inner: Mutex<(Role, u32)>,
}

impl DeviceIdentity {
    pub fn new(role: Role, instance: u32) -> Self {
        Self {
            inner: Mutex::new((role, instance)),
        }
    }

    pub fn role(&self) -> Role {
        self.lock().0
    }

    pub fn instance(&self) -> u32 {
        self.lock().1
    }

    /// Composite identity such as "grid:40".
    pub fn identity(&self) -> String {
        let (role, instance) = *self.lock();
        format!("{role}:{instance}")
    }

    /// Apply an external role write. An unknown role leaves the current one untouched.
    pub fn set_role(&self, requested: &str) -> Result<Role, RoleRejected> {
        let role = requested.parse::<Role>()?;
        self.lock().0 = role;
        Ok(role)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, (Role, u32)> {
        // The guarded pair is plain data; a poisoned lock still holds a valid value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
