//! Membership changes through the control plane

use crate::common::{Error, Result};
use crate::ctl::{ControlPlane, MemberId, MemberRecord};

/// Register `name` as a pending member; it must be started afterwards
pub async fn add_member(
    client: &dyn ControlPlane,
    name: &str,
    peer_urls: &[String],
) -> Result<MemberRecord> {
    let member = client.member_add(name, peer_urls).await?;
    tracing::info!(name, id = %format!("{:x}", member.id), ?peer_urls, "Added member");
    Ok(member)
}

/// Remove a member by id
///
/// Transient failures are returned as-is; callers decide whether to retry.
pub async fn remove_member(client: &dyn ControlPlane, id: MemberId) -> Result<()> {
    client.member_remove(id).await?;
    tracing::info!(id = %format!("{:x}", id), "Removed member");
    Ok(())
}

pub async fn list_members(client: &dyn ControlPlane) -> Result<Vec<MemberRecord>> {
    let members = client.member_list().await?;
    tracing::debug!(count = members.len(), "Listed members");
    Ok(members)
}

/// Id of the first member whose first client URL is `endpoint`
pub fn find_member_by_client_endpoint(members: &[MemberRecord], endpoint: &str) -> Result<MemberId> {
    members
        .iter()
        .find(|m| m.client_urls.first().map(String::as_str) == Some(endpoint))
        .map(|m| m.id)
        .ok_or_else(|| Error::MemberNotFound {
            endpoint: endpoint.to_string(),
        })
}
