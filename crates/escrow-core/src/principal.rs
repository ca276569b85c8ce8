//! # Authenticated Principals
//!
//! The identity layer authenticates a caller and hands the engine a
//! [`Principal`]. The role carried here is what the session claims; every
//! transition still re-derives whether the user is actually the client or
//! provider of the milestone it touches.

use serde::{Deserialize, Serialize};

use crate::identity::UserId;

/// Side of a case a user acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// The party paying for the work.
    Client,
    /// The party performing the work and receiving payouts.
    Provider,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "CLIENT",
            Self::Provider => "PROVIDER",
        }
    }

    /// The opposite side of the case.
    pub fn counterparty(&self) -> Role {
        match self {
            Self::Client => Self::Provider,
            Self::Provider => Self::Client,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Principal {
    user: UserId,
    role: Role,
}

impl Principal {
    /// Construct a principal from an authenticated session.
    ///
    /// Only the identity integration should call this. Request payloads
    /// never carry a principal.
    pub fn authenticated(user: UserId, role: Role) -> Self {
        Self { user, role }
    }

    /// The authenticated user.
    pub fn user(&self) -> UserId {
        self.user
    }

    /// The role claimed by the session.
    pub fn role(&self) -> Role {
        self.role
    }
}
