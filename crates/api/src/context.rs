use portal_core::OwnerId;

pub const ADMIN_ROLE: &str = "admin";

/// Principal context for a request (verified identity + roles).
///
/// Identity is established upstream; this is what the gateway vouched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal_id: OwnerId,
    roles: Vec<String>,
}

impl PrincipalContext {
    pub fn new(principal_id: OwnerId, roles: Vec<String>) -> Self {
        Self { principal_id, roles }
    }

    pub fn principal_id(&self) -> OwnerId {
        self.principal_id
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}
