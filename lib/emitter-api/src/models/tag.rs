use serde::{Deserialize, Serialize};

/// Version stamp attached to desired and actual records.
///
/// An empty epoch means the record is unversioned and always accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationTag {
    #[serde(default)]
    pub epoch: String,
    #[serde(default)]
    pub index: u32,
}

impl ModificationTag {
    pub fn new(epoch: impl Into<String>, index: u32) -> Self {
        Self {
            epoch: epoch.into(),
            index,
        }
    }

    /// Whether `other` is a newer version than `self`
    pub fn succeeded_by(&self, other: &ModificationTag) -> bool {
        if self.epoch.is_empty() || other.epoch.is_empty() {
            return true;
        }
        self.epoch != other.epoch || self.index < other.index
    }
}
