//! Data capture routines
//!
//! A routine fills the five sections of an aggregated record for one event.
//! The built-in [`DefaultRoutines`] always answers every category; providers
//! registered in the routine table may override any subset of them.

pub mod default;
pub mod table;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::models::{EventDescriptor, Section};

pub use default::DefaultRoutines;
pub use table::{RoutineContext, RoutineFactory, RoutineTable};

/// One of the fixed data sections of an aggregated record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    UserData,
    UdfData,
    MemberData,
    LpPeriod,
    ObjectData,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::UserData,
        Category::UdfData,
        Category::MemberData,
        Category::LpPeriod,
        Category::ObjectData,
    ];

    /// Capability method name, as used in override snapshots
    pub fn routine_name(&self) -> &'static str {
        match self {
            Category::UserData => "collectUserData",
            Category::UdfData => "collectUDFData",
            Category::MemberData => "collectMemberData",
            Category::LpPeriod => "collectLpPeriod",
            Category::ObjectData => "collectObjectData",
        }
    }

    /// Key of the section in an aggregated record
    pub fn section_key(&self) -> &'static str {
        match self {
            Category::UserData => "userdata",
            Category::UdfData => "udfdata",
            Category::MemberData => "memberdata",
            Category::LpPeriod => "lpperiod",
            Category::ObjectData => "objectdata",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.routine_name())
    }
}

/// Which categories a routine overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineOverrides {
    #[serde(rename = "collectUserData", default)]
    pub user_data: bool,
    #[serde(rename = "collectUDFData", default)]
    pub udf_data: bool,
    #[serde(rename = "collectMemberData", default)]
    pub member_data: bool,
    #[serde(rename = "collectLpPeriod", default)]
    pub lp_period: bool,
    #[serde(rename = "collectObjectData", alias = "getCollectObjectData", default)]
    pub object_data: bool,
}

impl RoutineOverrides {
    pub fn all() -> Self {
        Self::from_categories(&Category::ALL)
    }

    pub fn from_categories(categories: &[Category]) -> Self {
        let mut overrides = Self::default();
        for category in categories {
            overrides.set(*category, true);
        }
        overrides
    }

    pub fn is_set(&self, category: Category) -> bool {
        match category {
            Category::UserData => self.user_data,
            Category::UdfData => self.udf_data,
            Category::MemberData => self.member_data,
            Category::LpPeriod => self.lp_period,
            Category::ObjectData => self.object_data,
        }
    }

    pub fn set(&mut self, category: Category, value: bool) {
        match category {
            Category::UserData => self.user_data = value,
            Category::UdfData => self.udf_data = value,
            Category::MemberData => self.member_data = value,
            Category::LpPeriod => self.lp_period = value,
            Category::ObjectData => self.object_data = value,
        }
    }

    /// Keep only categories both sets agree on
    pub fn intersect(&self, other: &RoutineOverrides) -> Self {
        let mut result = Self::default();
        for category in Category::ALL {
            result.set(category, self.is_set(category) && other.is_set(category));
        }
        result
    }

    pub fn any(&self) -> bool {
        Category::ALL.iter().any(|c| self.is_set(*c))
    }

    pub fn categories(&self) -> Vec<Category> {
        Category::ALL.into_iter().filter(|c| self.is_set(*c)).collect()
    }
}

/// Capture capability implemented by the default routine and every provider
///
/// Returning an empty section means "nothing to contribute", which lets the
/// next routine in the category's chain answer.
pub trait DataCaptureRoutines: Send + Sync {
    fn collect_user_data(&self, event: &EventDescriptor) -> Result<Section, StorageError>;

    fn collect_udf_data(&self, event: &EventDescriptor) -> Result<Section, StorageError>;

    fn collect_member_data(&self, event: &EventDescriptor) -> Result<Section, StorageError>;

    fn collect_lp_period(&self, event: &EventDescriptor) -> Result<Section, StorageError>;

    fn collect_object_data(&self, event: &EventDescriptor) -> Result<Section, StorageError>;

    /// Categories this implementation replaces
    fn overrides(&self) -> RoutineOverrides {
        RoutineOverrides::default()
    }

    /// Categories the capability supports
    fn available_overrides(&self) -> RoutineOverrides {
        RoutineOverrides::all()
    }

    fn collect(&self, category: Category, event: &EventDescriptor) -> Result<Section, StorageError> {
        match category {
            Category::UserData => self.collect_user_data(event),
            Category::UdfData => self.collect_udf_data(event),
            Category::MemberData => self.collect_member_data(event),
            Category::LpPeriod => self.collect_lp_period(event),
            Category::ObjectData => self.collect_object_data(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_snapshot_json_keys() {
        let overrides = RoutineOverrides::from_categories(&[Category::UdfData, Category::ObjectData]);
        let json = serde_json::to_value(overrides).unwrap();

        assert_eq!(json["collectUDFData"], true);
        assert_eq!(json["collectObjectData"], true);
        assert_eq!(json["collectUserData"], false);
    }

    #[test]
    fn test_legacy_object_key_is_accepted() {
        let overrides: RoutineOverrides =
            serde_json::from_str(r#"{"getCollectObjectData": true, "collectLpPeriod": true}"#).unwrap();

        assert_eq!(overrides.categories(), vec![Category::LpPeriod, Category::ObjectData]);
    }

    #[test]
    fn test_intersect() {
        let declared = RoutineOverrides::from_categories(&[Category::UserData, Category::MemberData]);
        let supported = RoutineOverrides::from_categories(&[Category::MemberData]);

        let snapshot = declared.intersect(&supported);
        assert!(snapshot.is_set(Category::MemberData));
        assert!(!snapshot.is_set(Category::UserData));
        assert!(snapshot.any());
        assert!(!RoutineOverrides::default().any());
    }
}
