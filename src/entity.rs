//! Entity dimensions, groupings, and grouped entity keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dimension an event can be attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    User,
    Role,
    Warehouse,
    Database,
    Schema,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::User => write!(f, "user"),
            Dimension::Role => write!(f, "role"),
            Dimension::Warehouse => write!(f, "warehouse"),
            Dimension::Database => write!(f, "database"),
            Dimension::Schema => write!(f, "schema"),
        }
    }
}

/// Entity key of an event or of an aggregated record.
///
/// On an event every known dimension is filled in. On an aggregated record only
/// the dimensions of its [`Grouping`] are populated, so two records compare
/// equal exactly when they belong to the same group.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl EntityKey {
    pub fn get(&self, dim: Dimension) -> Option<&str> {
        let value = match dim {
            Dimension::User => &self.user,
            Dimension::Role => &self.role,
            Dimension::Warehouse => &self.warehouse,
            Dimension::Database => &self.database,
            Dimension::Schema => &self.schema,
        };
        // Blank strings from the source count as missing.
        value.as_deref().filter(|v| !v.trim().is_empty())
    }

    fn set(&mut self, dim: Dimension, value: Option<&str>) {
        let value = value.map(str::to_string);
        match dim {
            Dimension::User => self.user = value,
            Dimension::Role => self.role = value,
            Dimension::Warehouse => self.warehouse = value,
            Dimension::Database => self.database = value,
            Dimension::Schema => self.schema = value,
        }
    }

    /// Project this key onto `grouping`.
    ///
    /// Returns the first required dimension that is missing, if any.
    pub fn project(&self, grouping: &Grouping) -> Result<EntityKey, Dimension> {
        let mut key = EntityKey::default();
        for &dim in grouping.required {
            match self.get(dim) {
                Some(v) => key.set(dim, Some(v)),
                None => return Err(dim),
            }
        }
        for &dim in grouping.optional {
            key.set(dim, self.get(dim));
        }
        Ok(key)
    }

    /// Stable JSON form used as the storage key.
    pub fn to_storage_key(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_storage_key(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = [
            Dimension::User,
            Dimension::Role,
            Dimension::Warehouse,
            Dimension::Database,
            Dimension::Schema,
        ];
        let mut first = true;
        for dim in dims {
            if let Some(v) = self.get(dim) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{}={}", dim, v)?;
                first = false;
            }
        }
        if first {
            write!(f, "<global>")?;
        }
        Ok(())
    }
}

/// A named set of dimensions used to group events into records.
///
/// Events missing a `required` dimension are excluded from the grouping;
/// `optional` dimensions are carried through when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grouping {
    pub name: &'static str,
    pub required: &'static [Dimension],
    pub optional: &'static [Dimension],
}

impl Grouping {
    /// Write activity per role and database.
    pub const WRITE_ACTIVITY: Grouping = Grouping {
        name: "write_activity",
        required: &[Dimension::Role, Dimension::Database],
        optional: &[],
    };

    /// Consumption per role.
    pub const CONSUMPTION: Grouping = Grouping {
        name: "consumption",
        required: &[Dimension::Role],
        optional: &[],
    };

    /// Behavior profile per user and role.
    pub const BEHAVIOR: Grouping = Grouping {
        name: "behavior",
        required: &[Dimension::User, Dimension::Role],
        optional: &[],
    };

    /// Query-level cost entities inside a warehouse.
    pub const COST_ENTITY: Grouping = Grouping {
        name: "cost_entity",
        required: &[Dimension::Warehouse, Dimension::User],
        optional: &[Dimension::Role, Dimension::Database, Dimension::Schema],
    };

    /// Warehouse metering totals.
    pub const WAREHOUSE: Grouping = Grouping {
        name: "warehouse",
        required: &[Dimension::Warehouse],
        optional: &[],
    };

    /// Login activity per user.
    pub const USER_LOGINS: Grouping = Grouping {
        name: "user_logins",
        required: &[Dimension::User],
        optional: &[],
    };

    /// Login activity per role member.
    pub const ROLE_LOGINS: Grouping = Grouping {
        name: "role_logins",
        required: &[Dimension::Role, Dimension::User],
        optional: &[],
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: Option<&str>, role: Option<&str>) -> EntityKey {
        EntityKey {
            user: user.map(String::from),
            role: role.map(String::from),
            warehouse: Some("WH".into()),
            database: Some("SALES".into()),
            schema: None,
        }
    }

    #[test]
    fn test_project_keeps_only_grouping_dimensions() {
        let projected = key(Some("ALICE"), Some("ANALYST"))
            .project(&Grouping::BEHAVIOR)
            .unwrap();
        assert_eq!(projected.user.as_deref(), Some("ALICE"));
        assert_eq!(projected.role.as_deref(), Some("ANALYST"));
        assert!(projected.warehouse.is_none());
        assert!(projected.database.is_none());
    }

    #[test]
    fn test_project_reports_missing_required_dimension() {
        let err = key(Some("ALICE"), None)
            .project(&Grouping::BEHAVIOR)
            .unwrap_err();
        assert_eq!(err, Dimension::Role);

        // Blank values count as missing.
        let err = key(Some("ALICE"), Some("  "))
            .project(&Grouping::CONSUMPTION)
            .unwrap_err();
        assert_eq!(err, Dimension::Role);
    }

    #[test]
    fn test_missing_role_still_counts_for_other_groupings() {
        let k = key(Some("ALICE"), None);
        assert!(k.project(&Grouping::BEHAVIOR).is_err());
        assert!(k.project(&Grouping::USER_LOGINS).is_ok());
        let cost = k.project(&Grouping::COST_ENTITY).unwrap();
        assert!(cost.role.is_none());
        assert_eq!(cost.database.as_deref(), Some("SALES"));
    }

    #[test]
    fn test_storage_key_roundtrip_and_display() {
        let k = key(Some("ALICE"), Some("ANALYST"))
            .project(&Grouping::BEHAVIOR)
            .unwrap();
        let s = k.to_storage_key().unwrap();
        assert_eq!(s, r#"{"user":"ALICE","role":"ANALYST"}"#);
        assert_eq!(EntityKey::from_storage_key(&s).unwrap(), k);
        assert_eq!(k.to_string(), "user=ALICE,role=ANALYST");
        assert_eq!(EntityKey::default().to_string(), "<global>");
    }
}
