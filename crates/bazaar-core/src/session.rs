//! Session identity, principals, and the durable session record.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Opaque identifier for a client session.
///
/// Minted by the gateway on first contact and handed back to
/// cookie-capable clients via `Set-Cookie`, so the same session can be
/// recovered across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a SessionId from an existing string (e.g. a cookie value).
    ///
    /// Note: this does not validate the format; a stale or fabricated id
    /// simply fails to load from the store.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric account identifier, shared by buyers, merchants and admins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Principals
// ============================================================================

/// An authenticated identity attached to a session.
///
/// Merchants and admins are accounts too; every variant carries the
/// account id the connection registry keys on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Principal {
    /// An ordinary buyer account.
    User {
        /// Account id
        user: UserId,
    },

    /// A merchant operating a shop.
    Merchant {
        /// Account id
        user: UserId,
        /// The shop this merchant operates
        shop: i64,
    },

    /// A marketplace administrator.
    Admin {
        /// Account id
        user: UserId,
    },
}

impl Principal {
    /// The account id behind this principal.
    pub fn user_id(&self) -> UserId {
        match self {
            Self::User { user } | Self::Merchant { user, .. } | Self::Admin { user } => *user,
        }
    }

    /// Whether this principal has admin rights.
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin { .. })
    }
}

// ============================================================================
// Session
// ============================================================================

/// The live, in-memory session attached to one connection.
///
/// Mutated by external method handlers through the dispatch seam; the
/// durable projection is [`SessionRecord`], persisted after any material
/// change and recovered on reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// The opaque session id.
    pub id: SessionId,

    /// Authenticated identity, if the client has logged in.
    pub principal: Option<Principal>,

    /// When an admin is impersonating another account, the admin's own
    /// principal is kept here so the override can be dropped later.
    pub sudo_from: Option<Principal>,

    /// Phone number awaiting verification, if any.
    pub verify_phone: Option<String>,

    /// Verification token sent to `verify_phone`.
    pub verify_token: Option<String>,
}

impl Session {
    /// Creates an empty (unauthenticated) session.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            principal: None,
            sudo_from: None,
            verify_phone: None,
            verify_token: None,
        }
    }

    /// Restores a session from its durable record.
    pub fn from_record(id: SessionId, record: SessionRecord) -> Self {
        Self {
            id,
            principal: record.user.map(|user| Principal::User { user }),
            sudo_from: None,
            verify_phone: record.verify_phone,
            verify_token: record.verify_token,
        }
    }

    /// Whether a principal is attached.
    pub fn is_logged_in(&self) -> bool {
        self.principal.is_some()
    }

    /// The principal requests act as: the sudo target if an override is
    /// active, the authenticated principal otherwise.
    pub fn effective_principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Attaches an authenticated principal.
    pub fn login(&mut self, principal: Principal) {
        self.principal = Some(principal);
    }

    /// Drops the principal and any sudo override or verification state.
    pub fn logout(&mut self) {
        self.principal = None;
        self.sudo_from = None;
        self.verify_phone = None;
        self.verify_token = None;
    }

    /// Begins impersonating `target`, remembering the original principal.
    ///
    /// No-op unless an admin is logged in.
    pub fn sudo(&mut self, target: Principal) {
        let Some(current) = self.principal.clone() else {
            return;
        };
        if !current.is_admin() {
            debug!(session = %self.id.short(), "sudo refused for non-admin principal");
            return;
        }
        self.sudo_from = Some(current);
        self.principal = Some(target);
    }

    /// Ends impersonation, restoring the original principal.
    pub fn unsudo(&mut self) {
        if let Some(original) = self.sudo_from.take() {
            self.principal = Some(original);
        }
    }

    /// Projects the minimal recoverable state for persistence.
    ///
    /// Sudo overrides are deliberately ephemeral and never persisted.
    pub fn to_record(&self) -> SessionRecord {
        let user = self
            .sudo_from
            .as_ref()
            .or(self.principal.as_ref())
            .map(Principal::user_id);
        SessionRecord {
            user,
            verify_phone: self.verify_phone.clone(),
            verify_token: self.verify_token.clone(),
        }
    }
}

// ============================================================================
// Durable record
// ============================================================================

/// The minimal recoverable state stored per session id.
///
/// Updates are load-modify-store, never partial.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Authenticated account id, if logged in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserId>,

    /// Phone number awaiting verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_phone: Option<String>,

    /// Verification token sent to the phone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_token: Option<String>,
}

impl SessionRecord {
    /// A record for a freshly minted, unauthenticated session.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Principal {
        Principal::Admin { user: UserId(1) }
    }

    fn buyer(id: i64) -> Principal {
        Principal::User { user: UserId(id) }
    }

    #[test]
    fn test_session_id_generate_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_session_id_short() {
        let id = SessionId::new("abcdefgh12345678");
        assert_eq!(id.short(), "abcdefgh");
        let tiny = SessionId::new("abc");
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn test_principal_user_id() {
        assert_eq!(buyer(7).user_id(), UserId(7));
        assert_eq!(
            Principal::Merchant {
                user: UserId(9),
                shop: 3
            }
            .user_id(),
            UserId(9)
        );
        assert_eq!(admin().user_id(), UserId(1));
    }

    #[test]
    fn test_login_logout() {
        let mut session = Session::new(SessionId::generate());
        assert!(!session.is_logged_in());

        session.login(buyer(5));
        assert!(session.is_logged_in());

        session.logout();
        assert!(!session.is_logged_in());
        assert!(session.verify_phone.is_none());
    }

    #[test]
    fn test_sudo_requires_admin() {
        let mut session = Session::new(SessionId::generate());
        session.login(buyer(5));
        session.sudo(buyer(6));
        // Not an admin: override refused
        assert_eq!(session.effective_principal(), Some(&buyer(5)));
        assert!(session.sudo_from.is_none());
    }

    #[test]
    fn test_sudo_and_unsudo() {
        let mut session = Session::new(SessionId::generate());
        session.login(admin());
        session.sudo(buyer(6));
        assert_eq!(session.effective_principal(), Some(&buyer(6)));

        session.unsudo();
        assert_eq!(session.effective_principal(), Some(&admin()));
        assert!(session.sudo_from.is_none());
    }

    #[test]
    fn test_record_omits_sudo_target() {
        let mut session = Session::new(SessionId::generate());
        session.login(admin());
        session.sudo(buyer(6));

        // The record persists the admin's own account, not the target.
        let record = session.to_record();
        assert_eq!(record.user, Some(UserId(1)));
    }

    #[test]
    fn test_record_roundtrip() {
        let record = SessionRecord {
            user: Some(UserId(42)),
            verify_phone: Some("15550001111".into()),
            verify_token: Some("931245".into()),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_from_record_restores_login() {
        let record = SessionRecord {
            user: Some(UserId(42)),
            verify_phone: None,
            verify_token: None,
        };
        let session = Session::from_record(SessionId::new("s1"), record);
        assert!(session.is_logged_in());
        assert_eq!(
            session.effective_principal().map(Principal::user_id),
            Some(UserId(42))
        );
    }

    #[test]
    fn test_empty_record_serializes_compact() {
        let json = serde_json::to_string(&SessionRecord::empty()).unwrap();
        assert_eq!(json, "{}");
    }
}
