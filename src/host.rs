//! Host collaborators consumed by capture and backfill
//!
//! The host owns its repository tree, role assignments, user profiles and
//! learning-progress marks. This crate only reads them through these traits,
//! so an embedding application can answer from its own storage while the
//! binary answers from the SQLite read model (`db::host::SqliteHost`).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Container types whose members carry a course-like role
pub const CONTAINER_TYPES: &[&str] = &["crs", "grp", "prg"];

/// An object resolved through one of its references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostObject {
    pub obj_id: i64,
    /// None when resolved by object id without a live reference
    pub ref_id: Option<i64>,
    pub obj_type: String,
    pub title: String,
    pub import_id: Option<String>,
}

/// One node on a path through the repository tree
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub ref_id: i64,
    pub obj_id: i64,
    pub obj_type: String,
    pub title: String,
    pub depth: i64,
}

/// Course start and end
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CoursePeriod {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub usr_id: i64,
    pub login: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub title: Option<String>,
    pub gender: Option<String>,
    pub email: Option<String>,
    pub institution: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub phone_office: Option<String>,
    pub hobby: Option<String>,
    pub department: Option<String>,
    pub phone_home: Option<String>,
    pub phone_mobile: Option<String>,
    pub fax: Option<String>,
    pub referral_comment: Option<String>,
    pub matriculation: Option<String>,
    pub active: bool,
    pub approve_date: Option<String>,
    pub agree_date: Option<String>,
    pub auth_mode: Option<String>,
    pub ext_account: Option<String>,
    pub birthday: Option<String>,
    pub import_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UdfDefinition {
    pub field_id: i64,
    pub field_name: String,
}

/// Learning progress mark of one user on one object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LpMark {
    pub status: i64,
    pub status_changed: Option<i64>,
    pub percentage: i64,
}

/// Repository tree lookups
pub trait ObjectTree: Send + Sync {
    fn object_by_ref_id(&self, ref_id: i64) -> Result<Option<HostObject>, StorageError>;

    /// Resolve an object through its first non-deleted reference
    fn object_by_obj_id(&self, obj_id: i64) -> Result<Option<HostObject>, StorageError>;

    /// Nodes from the root down to `ref_id` (inclusive)
    fn path_to_root(&self, ref_id: i64) -> Result<Vec<TreeNode>, StorageError>;

    fn course_period(&self, obj_id: i64) -> Result<Option<CoursePeriod>, StorageError>;

    /// Nearest node of one of `types`, starting at `ref_id` itself
    fn parent_of_type(&self, ref_id: i64, types: &[&str]) -> Result<Option<TreeNode>, StorageError> {
        let path = self.path_to_root(ref_id)?;
        Ok(path
            .into_iter()
            .rev()
            .find(|node| types.contains(&node.obj_type.as_str())))
    }
}

/// RBAC lookups
pub trait RoleAssignments: Send + Sync {
    /// Local role the user holds at a reference
    fn role_at_ref(&self, usr_id: i64, ref_id: i64) -> Result<Option<i64>, StorageError>;

    /// Raw role title, e.g. `il_crs_member_81`
    fn role_title(&self, rol_id: i64) -> Result<Option<String>, StorageError>;
}

pub trait UserProfiles: Send + Sync {
    fn user_by_id(&self, usr_id: i64) -> Result<Option<UserProfile>, StorageError>;

    fn visible_udf_definitions(&self) -> Result<Vec<UdfDefinition>, StorageError>;

    /// Stored custom field values of a user, keyed by field id
    fn udf_values(&self, usr_id: i64) -> Result<HashMap<i64, String>, StorageError>;
}

pub trait LearningProgress: Send + Sync {
    fn lp_mark(&self, obj_id: i64, usr_id: i64) -> Result<Option<LpMark>, StorageError>;
}

/// String blob store keyed by setting name
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Write `value` only if the stored value still equals `expected`
    fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: &str) -> Result<bool, StorageError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }

    fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: &str) -> Result<bool, StorageError> {
        (**self).compare_and_swap(key, expected, value)
    }
}

/// Everything the capture pipeline reads from the host
pub trait HostDirectory: ObjectTree + RoleAssignments + UserProfiles + LearningProgress + KeyValueStore {}

impl<T> HostDirectory for T where T: ObjectTree + RoleAssignments + UserProfiles + LearningProgress + KeyValueStore {}
