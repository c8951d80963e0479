//! Capture settings - field toggles and object type selection

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::db::{settings, QueueDb, SettingsRow};
use crate::error::StorageError;

/// Master toggle for the whole user section
pub const USER_FIELDS: &str = "user_fields";
/// Toggle for custom field data
pub const UDF_FIELDS: &str = "udf_fields";
/// Captured object type, `*` for all
pub const OBJ_SELECT: &str = "obj_select";

/// Per-field toggles and the user section key each one controls
pub const USER_FIELD_TOGGLES: &[(&str, &str)] = &[
    ("user_id", "user_id"),
    ("login", "username"),
    ("firstname", "firstname"),
    ("lastname", "lastname"),
    ("title", "title"),
    ("gender", "gender"),
    ("email", "email"),
    ("institution", "institution"),
    ("street", "street"),
    ("city", "city"),
    ("country", "country"),
    ("phone_office", "phone_office"),
    ("hobby", "hobby"),
    ("department", "department"),
    ("phone_home", "phone_home"),
    ("phone_mobile", "phone_mobile"),
    ("fax", "phone_fax"),
    ("referral_comment", "referral_comment"),
    ("matriculation", "matriculation"),
    ("active", "active"),
    ("approval_date", "approval_date"),
    ("agree_date", "agree_date"),
    ("auth_mode", "auth_mode"),
    ("ext_account", "ext_account"),
    ("birthday", "birthday"),
    ("import_id", "import_id"),
];

/// Toggles that start enabled
const ENABLED_BY_DEFAULT: &[&str] = &[USER_FIELDS, "user_id", "login", "email", "ext_account", "import_id"];

/// Rows installed on first start
pub fn default_settings() -> Vec<SettingsRow> {
    let toggle = |keyword: &str| SettingsRow {
        keyword: keyword.to_string(),
        value: Some(if ENABLED_BY_DEFAULT.contains(&keyword) { "1" } else { "0" }.to_string()),
        value_type: "boolean".to_string(),
    };

    let mut rows = vec![toggle(USER_FIELDS)];
    rows.extend(USER_FIELD_TOGGLES.iter().map(|(keyword, _)| toggle(keyword)));
    rows.push(toggle(UDF_FIELDS));
    rows.push(SettingsRow {
        keyword: OBJ_SELECT.to_string(),
        value: Some("*".to_string()),
        value_type: "text".to_string(),
    });
    rows
}

/// In-memory snapshot of every setting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    values: HashMap<String, SettingsRow>,
}

impl Settings {
    pub fn from_rows(rows: Vec<SettingsRow>) -> Self {
        Self {
            values: rows.into_iter().map(|row| (row.keyword.clone(), row)).collect(),
        }
    }

    /// Snapshot holding the default rows, without touching storage
    pub fn defaults() -> Self {
        Self::from_rows(default_settings())
    }

    pub fn get(&self, keyword: &str) -> Option<&SettingsRow> {
        self.values.get(keyword)
    }

    pub fn value(&self, keyword: &str) -> Option<&str> {
        self.values.get(keyword).and_then(|row| row.value.as_deref())
    }

    /// Missing toggles count as disabled
    pub fn is_enabled(&self, keyword: &str) -> bool {
        matches!(self.value(keyword), Some("1") | Some("true"))
    }

    /// Selected object type, `None` when every type is captured
    pub fn obj_select(&self) -> Option<&str> {
        match self.value(OBJ_SELECT) {
            None | Some("") | Some("*") => None,
            Some(obj_type) => Some(obj_type),
        }
    }

    /// Set a value in the snapshot only
    pub fn with_value(mut self, keyword: &str, value: &str) -> Self {
        let value_type = self
            .values
            .get(keyword)
            .map(|row| row.value_type.clone())
            .unwrap_or_else(|| "boolean".to_string());
        self.values.insert(
            keyword.to_string(),
            SettingsRow {
                keyword: keyword.to_string(),
                value: Some(value.to_string()),
                value_type,
            },
        );
        self
    }

    pub fn rows(&self) -> Vec<&SettingsRow> {
        let mut rows: Vec<_> = self.values.values().collect();
        rows.sort_by(|a, b| a.keyword.cmp(&b.keyword));
        rows
    }
}

/// Settings facade over `lerq_settings`
pub struct SettingsService {
    db: Arc<QueueDb>,
}

impl SettingsService {
    pub fn new(db: Arc<QueueDb>) -> Self {
        Self { db }
    }

    /// Load a full snapshot
    pub fn load(&self) -> Result<Settings, StorageError> {
        let rows = self.db.with_conn(settings::list_settings)?;
        Ok(Settings::from_rows(rows))
    }

    pub fn get(&self, keyword: &str) -> Result<Option<SettingsRow>, StorageError> {
        Ok(self.load()?.get(keyword).cloned())
    }

    /// Full-row upsert
    pub fn set(&self, keyword: &str, value: &str, value_type: &str) -> Result<(), StorageError> {
        if keyword.is_empty() {
            return Err(StorageError::InvalidInput("setting keyword is required".into()));
        }
        let row = SettingsRow {
            keyword: keyword.to_string(),
            value: Some(value.to_string()),
            value_type: value_type.to_string(),
        };
        self.db.with_conn(|conn| settings::upsert_setting(conn, &row))
    }

    pub fn remove(&self, keyword: &str) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| settings::delete_setting(conn, keyword))
    }

    /// Add missing default rows, leaving existing values alone
    pub fn install_defaults(&self) -> Result<usize, StorageError> {
        let rows = default_settings();
        let added = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction()
                .map_err(|e| StorageError::Internal(format!("Transaction failed: {}", e)))?;
            let mut added = 0;
            for row in &rows {
                if settings::insert_setting_if_missing(&tx, row)? {
                    added += 1;
                }
            }
            tx.commit()
                .map_err(|e| StorageError::Internal(format!("Commit failed: {}", e)))?;
            Ok(added)
        })?;

        if added > 0 {
            info!(added, "Installed default capture settings");
        }
        Ok(added)
    }
}
