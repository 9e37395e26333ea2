//! Team membership queries, served by one-shot `team api` calls.

use crate::api::Api;
use crate::error::Result;
use crate::models::{TeamDetails, TeamMembersDetails, UserMemberships, UserTeamMembership};
use crate::protocol::{ApiFamily, Request};

impl Api {
    /// Members of `team`, grouped by role.
    pub async fn list_members_of_team(&self, team: &str) -> Result<TeamMembersDetails> {
        let request = Request::new("list-team-memberships", serde_json::json!({ "team": team }));
        let details: TeamDetails = self.call(ApiFamily::Team, &request).await?;
        Ok(details.members)
    }

    /// Teams `username` belongs to.
    pub async fn list_user_memberships(&self, username: &str) -> Result<Vec<UserTeamMembership>> {
        let request = Request::new(
            "list-user-memberships",
            serde_json::json!({ "username": username }),
        );
        let memberships: UserMemberships = self.call(ApiFamily::Team, &request).await?;
        Ok(memberships.teams.unwrap_or_default())
    }
}
