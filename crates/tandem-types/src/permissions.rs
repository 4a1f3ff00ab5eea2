//! Channel access evaluation.
//!
//! Resolution order:
//! 1. not a project member -> no access, whatever rows exist
//! 2. explicit `ChannelPermission` row -> its booleans
//! 3. public channel -> view + post
//! 4. private channel -> the configured default grantees get view + post,
//!    everyone else gets nothing

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Channel, ChannelPermission, ProjectRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Access {
    pub can_view: bool,
    pub can_post: bool,
}

impl Access {
    pub const NONE: Access = Access { can_view: false, can_post: false };
    pub const FULL: Access = Access { can_view: true, can_post: true };
}

/// Who may see a private channel that has no explicit row for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivateDefault {
    Creator,
    Admins,
    #[default]
    CreatorAndAdmins,
    Nobody,
}

impl FromStr for PrivateDefault {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creator" => Ok(Self::Creator),
            "admins" => Ok(Self::Admins),
            "creator_and_admins" => Ok(Self::CreatorAndAdmins),
            "nobody" => Ok(Self::Nobody),
            other => Err(format!("unknown private channel default '{}'", other)),
        }
    }
}

/// The user asking, as seen by the membership collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subject {
    pub user_id: Uuid,
    /// `None` when the user is not a member of the channel's project.
    pub role: Option<ProjectRole>,
}

/// Pure mapping `(user, channel) -> Access`. Performs no I/O: callers fetch
/// the membership role and the (single) explicit row beforehand.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionEvaluator {
    policy: PrivateDefault,
}

impl PermissionEvaluator {
    pub fn new(policy: PrivateDefault) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> PrivateDefault {
        self.policy
    }

    pub fn resolve(
        &self,
        subject: &Subject,
        channel: &Channel,
        explicit: Option<&ChannelPermission>,
    ) -> Access {
        let Some(role) = subject.role else {
            return Access::NONE;
        };

        if let Some(row) = explicit {
            debug_assert_eq!(row.user_id, subject.user_id);
            debug_assert_eq!(row.channel_id, channel.id);
            return Access {
                can_view: row.can_view,
                can_post: row.can_post,
            };
        }

        if !channel.is_private {
            return Access::FULL;
        }

        let is_creator = channel.created_by == subject.user_id;
        let is_admin = role == ProjectRole::Admin;
        let granted = match self.policy {
            PrivateDefault::Creator => is_creator,
            PrivateDefault::Admins => is_admin,
            PrivateDefault::CreatorAndAdmins => is_creator || is_admin,
            PrivateDefault::Nobody => false,
        };

        if granted { Access::FULL } else { Access::NONE }
    }

    pub fn can_view(
        &self,
        subject: &Subject,
        channel: &Channel,
        explicit: Option<&ChannelPermission>,
    ) -> bool {
        self.resolve(subject, channel, explicit).can_view
    }

    pub fn can_post(
        &self,
        subject: &Subject,
        channel: &Channel,
        explicit: Option<&ChannelPermission>,
    ) -> bool {
        self.resolve(subject, channel, explicit).can_post
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn channel(is_private: bool, created_by: Uuid) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "general".into(),
            description: None,
            is_private,
            message_count: 0,
            created_by,
            created_at: Utc::now(),
        }
    }

    fn member(role: Option<ProjectRole>) -> Subject {
        Subject { user_id: Uuid::new_v4(), role }
    }

    #[test]
    fn public_channel_without_row_grants_everything_to_members() {
        let eval = PermissionEvaluator::default();
        let ch = channel(false, Uuid::new_v4());
        for role in [ProjectRole::Member, ProjectRole::Admin] {
            assert_eq!(eval.resolve(&member(Some(role)), &ch, None), Access::FULL);
        }
    }

    #[test]
    fn private_channel_without_row_denies_plain_members() {
        let ch = channel(true, Uuid::new_v4());
        for policy in [
            PrivateDefault::Creator,
            PrivateDefault::Admins,
            PrivateDefault::CreatorAndAdmins,
            PrivateDefault::Nobody,
        ] {
            let eval = PermissionEvaluator::new(policy);
            assert_eq!(eval.resolve(&member(Some(ProjectRole::Member)), &ch, None), Access::NONE);
        }
    }

    #[test]
    fn non_members_are_denied_even_with_a_granting_row() {
        let eval = PermissionEvaluator::default();
        let ch = channel(false, Uuid::new_v4());
        let subject = member(None);
        let row = ChannelPermission {
            channel_id: ch.id,
            user_id: subject.user_id,
            can_view: true,
            can_post: true,
        };
        assert_eq!(eval.resolve(&subject, &ch, Some(&row)), Access::NONE);
    }

    #[test]
    fn explicit_row_is_authoritative() {
        let eval = PermissionEvaluator::default();
        let subject = member(Some(ProjectRole::Member));

        let private = channel(true, Uuid::new_v4());
        let read_only = ChannelPermission {
            channel_id: private.id,
            user_id: subject.user_id,
            can_view: true,
            can_post: false,
        };
        assert!(eval.can_view(&subject, &private, Some(&read_only)));
        assert!(!eval.can_post(&subject, &private, Some(&read_only)));

        // A row can also take rights away on a public channel.
        let public = channel(false, Uuid::new_v4());
        let muted = ChannelPermission { channel_id: public.id, ..read_only };
        assert_eq!(
            eval.resolve(&subject, &public, Some(&muted)),
            Access { can_view: true, can_post: false }
        );
    }

    #[test]
    fn private_default_grantees_follow_policy() {
        let creator = Uuid::new_v4();
        let ch = channel(true, creator);
        let as_creator = Subject { user_id: creator, role: Some(ProjectRole::Member) };
        let admin = member(Some(ProjectRole::Admin));

        let cases = [
            (PrivateDefault::Creator, true, false),
            (PrivateDefault::Admins, false, true),
            (PrivateDefault::CreatorAndAdmins, true, true),
            (PrivateDefault::Nobody, false, false),
        ];
        for (policy, creator_sees, admin_sees) in cases {
            let eval = PermissionEvaluator::new(policy);
            assert_eq!(eval.can_view(&as_creator, &ch, None), creator_sees, "{:?}", policy);
            assert_eq!(eval.can_view(&admin, &ch, None), admin_sees, "{:?}", policy);
        }
    }

    #[test]
    fn policy_parses_config_values() {
        assert_eq!("admins".parse::<PrivateDefault>().unwrap(), PrivateDefault::Admins);
        assert!("everyone".parse::<PrivateDefault>().is_err());
    }
}
