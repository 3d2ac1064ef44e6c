//! Room membership models supplied by the room collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a room member (also the signaling/relay address).
pub type UserId = Uuid;

/// Identifier of a watch room.
pub type RoomId = Uuid;

/// A member of a watch room.
///
/// Membership is owned by the room layer; the voice core only reacts to changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: UserId,
    pub name: String,
    pub is_self: bool,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn new(id: UserId, name: impl Into<String>, is_self: bool) -> Self {
        Self {
            id,
            name: name.into(),
            is_self,
            joined_at: Utc::now(),
        }
    }
}

/// Members other than `self_id`, in the order supplied.
pub fn others(members: &[Member], self_id: UserId) -> impl Iterator<Item = &Member> {
    members
        .iter()
        .filter(move |m| !m.is_self && m.id != self_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn others_skips_self_by_flag_and_id() {
        let me = Uuid::new_v4();
        let members = vec![
            Member::new(me, "me", false),
            Member::new(Uuid::new_v4(), "flagged", true),
            Member::new(Uuid::new_v4(), "bob", false),
        ];
        let names: Vec<_> = others(&members, me).map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["bob"]);
    }

    #[test]
    fn member_serializes_camel_case() {
        let m = Member::new(Uuid::nil(), "alice", true);
        let json = serde_json::to_value(&m).expect("serialize member");
        assert_eq!(json["isSelf"], true);
        assert_eq!(json["name"], "alice");
    }
}
