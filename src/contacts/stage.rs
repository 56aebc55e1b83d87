//! Conversation stage graph: where a contact is in the scripted funnel.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the four top-level offerings a contact can pick from the menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    OnlineDoctor,
    CyberClinic,
    Referral,
    SmartCalendar,
}

impl Track {
    /// Menu order.
    pub const ALL: [Track; 4] = [
        Track::OnlineDoctor,
        Track::CyberClinic,
        Track::Referral,
        Track::SmartCalendar,
    ];

    /// The list-row id used on the wire and in storage.
    pub fn id(&self) -> &'static str {
        match self {
            Self::OnlineDoctor => "online_doctor",
            Self::CyberClinic => "cyber_clinic",
            Self::Referral => "referral",
            Self::SmartCalendar => "smart_calendar",
        }
    }

    /// Resolve a list-selection id to a track.
    pub fn from_id(id: &str) -> Option<Track> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// The stage of a contact within the scripted conversation.
///
/// Profile collection is a strict linear prefix:
/// Initial → CollectingName → CollectingCity → CollectingSpecialty → Menu.
/// After that the contact cycles between `Menu` and the track stages and
/// never re-enters the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Stage {
    Initial,
    CollectingName,
    CollectingCity,
    CollectingSpecialty,
    Menu,
    InTrack(Track),
}

impl Stage {
    /// Check if a move from `self` to a *different* `target` is allowed.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;
        if *self == target {
            return false;
        }
        matches!(
            (self, target),
            (Initial, CollectingName)
                | (CollectingName, CollectingCity)
                | (CollectingCity, CollectingSpecialty)
                | (CollectingSpecialty, Menu)
                | (Menu, InTrack(_))
                | (InTrack(_), Menu)
                | (InTrack(_), InTrack(_))
        )
    }

    /// Next stage in the profile-collection prefix, if any.
    pub fn next_in_profile(&self) -> Option<Stage> {
        use Stage::*;
        match self {
            Initial => Some(CollectingName),
            CollectingName => Some(CollectingCity),
            CollectingCity => Some(CollectingSpecialty),
            CollectingSpecialty => Some(Menu),
            Menu | InTrack(_) => None,
        }
    }

    /// Whether the contact has finished profile collection.
    pub fn is_post_profile(&self) -> bool {
        matches!(self, Self::Menu | Self::InTrack(_))
    }

    /// The track this stage belongs to, if it is a track stage.
    pub fn track(&self) -> Option<Track> {
        match self {
            Self::InTrack(track) => Some(*track),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::CollectingName => "collecting_name",
            Self::CollectingCity => "collecting_city",
            Self::CollectingSpecialty => "collecting_specialty",
            Self::Menu => "menu",
            Self::InTrack(track) => track.id(),
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::Initial
    }
}

impl From<Track> for Stage {
    fn from(track: Track) -> Self {
        Self::InTrack(track)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "collecting_name" => Ok(Self::CollectingName),
            "collecting_city" => Ok(Self::CollectingCity),
            "collecting_specialty" => Ok(Self::CollectingSpecialty),
            "menu" => Ok(Self::Menu),
            other => Track::from_id(other)
                .map(Self::InTrack)
                .ok_or_else(|| format!("unknown stage: {other}")),
        }
    }
}

impl From<Stage> for String {
    fn from(stage: Stage) -> Self {
        stage.as_str().to_string()
    }
}

impl TryFrom<String> for Stage {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
