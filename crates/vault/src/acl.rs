//! Access control over a team's secret namespace.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Owner,
    Read,
    Write,
}

/// Grants held on one team's secrets. The only grantee is the owning team.
#[derive(Debug, Clone)]
pub struct Acl {
    team_id: String,
    grants: Vec<Permission>,
}

impl Acl {
    /// The owning team gets Owner, Read and Write over its own namespace.
    pub fn owned_by(team_id: &str) -> Self {
        Self {
            team_id: team_id.to_string(),
            grants: vec![Permission::Owner, Permission::Read, Permission::Write],
        }
    }

    pub fn permits(&self, team_id: &str, permission: Permission) -> bool {
        self.team_id == team_id && self.grants.contains(&permission)
    }
}
