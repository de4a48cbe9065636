//! Synchronized entity kinds and their column schemas

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::util::{parse_timestamp_ms, value_is_truthy};

/// A complete record snapshot: field name -> value.
pub type Snapshot = Map<String, Value>;

/// How a column is stored in the local and remote stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Free text
    Text,
    /// 64-bit integer
    Integer,
    /// Stored as 0/1
    Boolean,
    /// Unix milliseconds
    Timestamp,
    /// JSON document stored as text
    Json,
}

/// A column of a synchronized table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: &'static str,
    /// Storage kind
    pub kind: ColumnKind,
}

const fn column(name: &'static str, kind: ColumnKind) -> Column {
    Column { name, kind }
}

const ATTEMPT_COLUMNS: &[Column] = &[
    column("id", ColumnKind::Text),
    column("learner_id", ColumnKind::Text),
    column("quiz_id", ColumnKind::Text),
    column("answers", ColumnKind::Json),
    column("score", ColumnKind::Integer),
    column("is_final", ColumnKind::Boolean),
    column("completed_at", ColumnKind::Timestamp),
    column("created_at", ColumnKind::Timestamp),
    column("updated_at", ColumnKind::Timestamp),
];

const LEARNER_COLUMNS: &[Column] = &[
    column("id", ColumnKind::Text),
    column("display_name", ColumnKind::Text),
    column("email", ColumnKind::Text),
    column("created_at", ColumnKind::Timestamp),
    column("updated_at", ColumnKind::Timestamp),
];

const QUIZ_COLUMNS: &[Column] = &[
    column("id", ColumnKind::Text),
    column("title", ColumnKind::Text),
    column("description", ColumnKind::Text),
    column("question_count", ColumnKind::Integer),
    column("created_at", ColumnKind::Timestamp),
    column("updated_at", ColumnKind::Timestamp),
];

const QUESTION_COLUMNS: &[Column] = &[
    column("id", ColumnKind::Text),
    column("quiz_id", ColumnKind::Text),
    column("prompt", ColumnKind::Text),
    column("choices", ColumnKind::Json),
    column("correct_choice", ColumnKind::Integer),
    column("position", ColumnKind::Integer),
    column("updated_at", ColumnKind::Timestamp),
];

/// Every table the sync subsystem knows how to move between stores.
///
/// Dispatch on this enum replaces raw table-name matching: an unknown table
/// name fails once at parse time with [`Error::UnsupportedTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// Graded quiz attempt (answers, finality, score)
    #[serde(rename = "quiz_attempts")]
    Attempt,
    /// Learner profile
    #[serde(rename = "learners")]
    Learner,
    /// Quiz definition (reference data)
    #[serde(rename = "quizzes")]
    Quiz,
    /// Quiz question (reference data)
    #[serde(rename = "questions")]
    Question,
}

impl EntityKind {
    /// All entity kinds, pushable tables first.
    pub const ALL: [Self; 4] = [Self::Attempt, Self::Learner, Self::Quiz, Self::Question];

    /// Tables authored on the client and pushed to the remote store.
    pub const PUSHABLE: [Self; 2] = [Self::Attempt, Self::Learner];

    /// Tables authored remotely and pulled to the client.
    pub const REFERENCE: [Self; 2] = [Self::Quiz, Self::Question];

    /// Table name in both stores
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Attempt => "quiz_attempts",
            Self::Learner => "learners",
            Self::Quiz => "quizzes",
            Self::Question => "questions",
        }
    }

    /// Columns shared by the local and remote copies of the table
    pub const fn columns(self) -> &'static [Column] {
        match self {
            Self::Attempt => ATTEMPT_COLUMNS,
            Self::Learner => LEARNER_COLUMNS,
            Self::Quiz => QUIZ_COLUMNS,
            Self::Question => QUESTION_COLUMNS,
        }
    }

    /// Whether local rows carry a `synced` flag and are pushed upstream
    pub const fn is_pushable(self) -> bool {
        matches!(self, Self::Attempt | Self::Learner)
    }

    /// Fields compared by conflict detection besides `updated_at`
    pub const fn content_fields(self) -> &'static [&'static str] {
        match self {
            Self::Attempt => &["answers", "is_final", "completed_at", "score"],
            Self::Learner => &["display_name", "email"],
            Self::Quiz => &["title", "description", "question_count"],
            Self::Question => &["prompt", "choices", "correct_choice", "position"],
        }
    }

    /// Fields typed in by a person that a resolution must not silently drop
    pub const fn user_authored_fields(self) -> &'static [&'static str] {
        match self {
            Self::Attempt => &["answers"],
            Self::Learner => &["display_name"],
            Self::Quiz | Self::Question => &[],
        }
    }

    /// Look up a column by name
    pub fn column(self, name: &str) -> Option<&'static Column> {
        self.columns().iter().find(|column| column.name == name)
    }

    /// Keep only known columns and coerce values to their column kinds.
    ///
    /// Unknown fields (including the local-only `synced` flag) are dropped.
    pub fn normalize(self, snapshot: &Snapshot) -> Snapshot {
        self.columns()
            .iter()
            .map(|column| {
                let value = snapshot.get(column.name).cloned().unwrap_or(Value::Null);
                (column.name.to_string(), coerce_value(column.kind, value))
            })
            .collect()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.table_name() == s.trim())
            .ok_or_else(|| Error::UnsupportedTable(s.to_string()))
    }
}

fn coerce_value(kind: ColumnKind, value: Value) -> Value {
    match (kind, value) {
        (_, Value::Null) => Value::Null,
        (ColumnKind::Boolean, value) => Value::Bool(value_is_truthy(Some(&value))),
        (ColumnKind::Timestamp, value) => {
            parse_timestamp_ms(Some(&value)).map_or(value, Value::from)
        }
        (ColumnKind::Integer, Value::String(text)) => text
            .trim()
            .parse::<i64>()
            .map_or(Value::String(text), Value::from),
        (ColumnKind::Json, Value::String(text)) => {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        }
        (_, value) => value,
    }
}

/// Record id of a snapshot, if present and non-empty
pub fn snapshot_id(snapshot: &Snapshot) -> Option<&str> {
    snapshot
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// `updated_at` of a snapshot in unix milliseconds
pub fn snapshot_updated_at(snapshot: &Snapshot) -> Option<i64> {
    parse_timestamp_ms(snapshot.get("updated_at"))
}

/// Whether an attempt snapshot has been submitted
pub fn attempt_is_final(snapshot: &Snapshot) -> bool {
    value_is_truthy(snapshot.get("is_final"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn table_names_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.table_name().parse::<EntityKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_table_is_rejected() {
        let error = "ghosts".parse::<EntityKind>().unwrap_err();
        assert!(matches!(error, Error::UnsupportedTable(name) if name == "ghosts"));
    }

    #[test]
    fn every_table_has_id_and_updated_at() {
        for kind in EntityKind::ALL {
            assert!(kind.column("id").is_some(), "{kind} lacks id");
            assert!(kind.column("updated_at").is_some(), "{kind} lacks updated_at");
        }
    }

    #[test]
    fn normalize_drops_unknown_fields_and_coerces() {
        let raw = json!({
            "id": "a1",
            "answers": "{\"q1\":\"b\"}",
            "is_final": 1,
            "updated_at": "1970-01-01T00:00:02Z",
            "synced": 0,
        });
        let normalized = EntityKind::Attempt.normalize(raw.as_object().unwrap());

        assert!(!normalized.contains_key("synced"));
        assert_eq!(normalized["answers"], json!({"q1": "b"}));
        assert_eq!(normalized["is_final"], json!(true));
        assert_eq!(normalized["updated_at"], json!(2000));
        assert_eq!(normalized["score"], Value::Null);
    }

    #[test]
    fn snapshot_helpers() {
        let snapshot = json!({"id": " a1 ", "updated_at": 5, "is_final": true});
        let snapshot = snapshot.as_object().unwrap();
        assert_eq!(snapshot_id(snapshot), Some("a1"));
        assert_eq!(snapshot_updated_at(snapshot), Some(5));
        assert!(attempt_is_final(snapshot));

        let blank = json!({"id": "  "});
        assert_eq!(snapshot_id(blank.as_object().unwrap()), None);
    }
}
