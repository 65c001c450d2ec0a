//! Users, roles and the session's current user.

use crate::error::{Result, StoreError};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Something an operation needs to be allowed to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Compact,
    Verify,
    Report,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
            Permission::Compact => "compact",
            Permission::Verify => "verify",
            Permission::Report => "report",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Editor,
    Viewer,
}

impl Role {
    pub fn permissions(self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::Admin => &[Read, Write, Delete, Compact, Verify, Report],
            Role::Editor => &[Read, Write, Compact, Verify, Report],
            Role::Viewer => &[Read, Report],
        }
    }

    pub fn allows(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            other => Err(StoreError::InvalidFormat(format!("Unknown role: {}", other))),
        }
    }
}

/// A registered user.
#[derive(Clone)]
pub struct User {
    pub username: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    pub role: Role,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("username", &self.username)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// User registry plus the session's authenticated user.
#[derive(Default)]
pub struct AccessControl {
    users: RwLock<HashMap<String, User>>,
    current: RwLock<Option<String>>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, username: &str, password: &str, role: Role) -> Result<()> {
        if self.users.read().contains_key(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }

        // Hash outside the write lock; it is deliberately slow.
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| StoreError::Crypto(format!("Password hashing failed: {}", e)))?
            .to_string();

        let mut users = self.users.write();
        if users.contains_key(username) {
            return Err(StoreError::UserExists(username.to_string()));
        }
        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_hash,
                role,
            },
        );
        Ok(())
    }

    /// Make `username` the current user. Any failure logs the session out.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        let verified = self.verify(username, password);
        let mut current = self.current.write();
        match verified {
            Ok(()) => {
                *current = Some(username.to_string());
                Ok(())
            }
            Err(e) => {
                *current = None;
                Err(e)
            }
        }
    }

    fn verify(&self, username: &str, password: &str) -> Result<()> {
        let stored = self
            .users
            .read()
            .get(username)
            .map(|user| user.password_hash.clone())
            .ok_or_else(|| StoreError::Auth(format!("unknown user {}", username)))?;

        let parsed = PasswordHash::new(&stored)
            .map_err(|e| StoreError::Crypto(format!("Stored password hash is invalid: {}", e)))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| StoreError::Auth(format!("wrong password for {}", username)))
    }

    pub fn logout(&self) {
        *self.current.write() = None;
    }

    pub fn current_user(&self) -> Option<String> {
        self.current.read().clone()
    }

    pub fn role_of(&self, username: &str) -> Option<Role> {
        self.users.read().get(username).map(|user| user.role)
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    /// Fail unless the current user may do `permission`. Returns the user.
    pub fn check_permission(&self, permission: Permission) -> Result<String> {
        let Some(username) = self.current_user() else {
            return Err(StoreError::PermissionDenied {
                user: "anonymous".into(),
                permission: permission.to_string(),
            });
        };

        match self.role_of(&username) {
            Some(role) if role.allows(permission) => Ok(username),
            _ => Err(StoreError::PermissionDenied {
                user: username,
                permission: permission.to_string(),
            }),
        }
    }
}
