//! Aggregated capture output

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::routines::Category;

/// One category's data, keyed by field name
pub type Section = Map<String, Value>;

/// The five sections produced for one event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    #[serde(rename = "userdata")]
    pub user_data: Section,
    #[serde(rename = "udfdata")]
    pub udf_data: Section,
    #[serde(rename = "memberdata")]
    pub member_data: Section,
    #[serde(rename = "lpperiod")]
    pub lp_period: Section,
    #[serde(rename = "objectdata")]
    pub object_data: Section,
}

impl AggregatedRecord {
    pub fn section(&self, category: Category) -> &Section {
        match category {
            Category::UserData => &self.user_data,
            Category::UdfData => &self.udf_data,
            Category::MemberData => &self.member_data,
            Category::LpPeriod => &self.lp_period,
            Category::ObjectData => &self.object_data,
        }
    }

    pub fn section_mut(&mut self, category: Category) -> &mut Section {
        match category {
            Category::UserData => &mut self.user_data,
            Category::UdfData => &mut self.udf_data,
            Category::MemberData => &mut self.member_data,
            Category::LpPeriod => &mut self.lp_period,
            Category::ObjectData => &mut self.object_data,
        }
    }

    pub fn object_type(&self) -> Option<String> {
        self.object_data.get("type").and_then(value_as_string)
    }

    pub fn member_role(&self) -> Option<i64> {
        self.member_data.get("role").and_then(value_as_i64)
    }

    pub fn member_course_ref_id(&self) -> Option<i64> {
        self.member_data
            .get("course_ref_id")
            .and_then(value_as_i64)
            .filter(|id| *id > 0)
    }
}

/// An aggregated record plus the event metadata the writer persists
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedEvent {
    pub record: AggregatedRecord,
    pub event: String,
    pub timestamp: i64,
    pub progress: String,
    pub progress_changed: Option<i64>,
    pub assignment: String,
}

/// Integer view of a JSON value, accepting numeric strings
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

/// String view of a JSON value, stringifying scalars
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.as_str() {
            "1" | "true" => Some(true),
            "0" | "false" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lenient_conversions() {
        assert_eq!(value_as_i64(&json!("42")), Some(42));
        assert_eq!(value_as_i64(&json!(7)), Some(7));
        assert_eq!(value_as_i64(&json!(null)), None);
        assert_eq!(value_as_string(&json!(5)), Some("5".to_string()));
        assert_eq!(value_as_bool(&json!("1")), Some(true));
        assert_eq!(value_as_bool(&json!(0)), Some(false));
    }

    #[test]
    fn test_member_accessors() {
        let mut record = AggregatedRecord::default();
        record.member_data.insert("role".into(), json!("4"));
        record.member_data.insert("course_ref_id".into(), json!(-1));

        assert_eq!(record.member_role(), Some(4));
        assert_eq!(record.member_course_ref_id(), None);
    }
}
