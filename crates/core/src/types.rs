use crate::error::{RotatorError, RotatorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub const MIN: Self = Self(i64::MIN);
            pub const MAX: Self = Self(i64::MAX);

            /// Reject ids that can never name a stored row.
            pub fn validate(self) -> RotatorResult<Self> {
                if self.0 > 0 {
                    Ok(self)
                } else {
                    Err(RotatorError::InvalidInput(format!(
                        concat!($label, " id must be positive, got {}"),
                        self.0
                    )))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

entity_id!(
    /// Identifier of an advertising banner.
    BannerId,
    "banner"
);
entity_id!(
    /// Identifier of a content slot banners are rotated in.
    SlotId,
    "slot"
);
entity_id!(
    /// Identifier of an audience social group.
    SocialGroupId,
    "social group"
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Banner {
    pub id: BannerId,
    pub description: String,
    /// Denormalized lifetime displays across all slots. Advisory only.
    pub total_display: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub description: String,
    /// Lifetime displays in this slot across all social groups.
    pub total_display: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialGroup {
    pub id: SocialGroupId,
    pub description: String,
}

/// One banner's counters within a (slot, social group) context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arm {
    pub id: BannerId,
    /// Displays (impressions).
    pub trials: u64,
    /// Clicks.
    pub reward: u64,
}

impl Arm {
    pub fn new(id: BannerId, trials: u64, reward: u64) -> Self {
        Self {
            id,
            trials,
            reward,
        }
    }

    pub fn untried(id: BannerId) -> Self {
        Self::new(id, 0, 0)
    }
}

/// Arms for a context together with the slot's lifetime display count,
/// read from a single consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmSnapshot {
    pub arms: Vec<Arm>,
    pub slot_total_display: u64,
}

impl ArmSnapshot {
    pub fn arm(&self, banner: BannerId) -> Option<&Arm> {
        self.arms.iter().find(|a| a.id == banner)
    }

    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }
}

/// Which counter a selection writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOutcome {
    /// Count the selection as an impression of the chosen banner.
    #[default]
    Display,
    /// Count the selection as a click, as the legacy rotator did. Trials
    /// only grow through separately recorded displays, so without them
    /// warm-up keeps returning the first untried banner.
    Click,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationEventType {
    BannerSelected,
    Click,
    Display,
    AssignmentAdded,
    AssignmentRemoved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationEvent {
    pub event_id: uuid::Uuid,
    pub event_type: RotationEventType,
    pub banner_id: BannerId,
    pub slot_id: SlotId,
    pub social_group_id: Option<SocialGroupId>,
    pub timestamp: DateTime<Utc>,
}
