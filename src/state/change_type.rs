/// Change classification between two consecutive snapshots
use std::fmt;

/// The dominant kind of change observed between two snapshots
///
/// Classification is mutually exclusive; see [`crate::detect`] for the
/// priority order in which variants are tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    NoChange,
    MajorRedesign,
    StructureChanged,
    ResourcesChanged,
    ContentAdded,
    ContentRemoved,
    ContentModified,
}

impl ChangeType {
    /// Returns true for every variant except `NoChange`
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoChange)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::NoChange => "no_change",
            Self::MajorRedesign => "major_redesign",
            Self::StructureChanged => "structure_changed",
            Self::ResourcesChanged => "resources_changed",
            Self::ContentAdded => "content_added",
            Self::ContentRemoved => "content_removed",
            Self::ContentModified => "content_modified",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "no_change" => Some(Self::NoChange),
            "major_redesign" => Some(Self::MajorRedesign),
            "structure_changed" => Some(Self::StructureChanged),
            "resources_changed" => Some(Self::ResourcesChanged),
            "content_added" => Some(Self::ContentAdded),
            "content_removed" => Some(Self::ContentRemoved),
            "content_modified" => Some(Self::ContentModified),
            _ => None,
        }
    }

    /// Returns all change types
    pub fn all() -> Vec<Self> {
        vec![
            Self::NoChange,
            Self::MajorRedesign,
            Self::StructureChanged,
            Self::ResourcesChanged,
            Self::ContentAdded,
            Self::ContentRemoved,
            Self::ContentModified,
        ]
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
