//! LMS records as stored in the document database.
//!
//! Field names follow the store's camelCase convention. The document id is
//! carried in `id`; it is filled in on read and stripped on write.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A record type stored in its own collection.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
  /// Collection name in the document store
  const COLLECTION: &'static str;

  fn id(&self) -> &str;
}

macro_rules! impl_record {
  ($($ty:ty => $collection:literal),* $(,)?) => {
    $(
      impl Record for $ty {
        const COLLECTION: &'static str = $collection;

        fn id(&self) -> &str {
          &self.id
        }
      }
    )*
  };
}

impl_record! {
  UserProfile => "users",
  Class => "classes",
  ClassMember => "classMembers",
  JoinRequest => "joinRequests",
  Assignment => "assignments",
  Submission => "submissions",
  Group => "groups",
  GroupSubmission => "groupSubmissions",
  CalendarEvent => "calendarEvents",
  ChatMessage => "chatMessages",
}

/// Timestamps are written with a fixed nanosecond precision, so their text
/// sorts the same way as the instants.
pub(crate) mod timestamp {
  use chrono::{DateTime, SecondsFormat, Utc};
  use serde::Serializer;

  pub fn format(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
  }

  pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format(at))
  }

  pub mod option {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
      at: &Option<DateTime<Utc>>,
      serializer: S,
    ) -> Result<S::Ok, S::Error> {
      match at {
        Some(at) => super::serialize(at, serializer),
        None => serializer.serialize_none(),
      }
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  #[default]
  Student,
  Teacher,
  Admin,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
  #[serde(default)]
  pub id: String,
  pub display_name: String,
  #[serde(default)]
  pub email: String,
  #[serde(default)]
  pub role: Role,
  #[serde(default)]
  pub avatar_url: Option<String>,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Class {
  #[serde(default)]
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub subject: String,
  #[serde(default)]
  pub description: String,
  pub teacher_id: String,
  #[serde(default)]
  pub join_code: Option<String>,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassMember {
  #[serde(default)]
  pub id: String,
  pub class_id: String,
  pub user_id: String,
  #[serde(default)]
  pub role: Role,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
  #[default]
  Pending,
  Approved,
  Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
  #[serde(default)]
  pub id: String,
  pub class_id: String,
  pub user_id: String,
  #[serde(default)]
  pub status: RequestStatus,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub requested_at: Option<DateTime<Utc>>,
}

fn default_max_score() -> f64 {
  100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
  #[serde(default)]
  pub id: String,
  pub class_id: String,
  pub teacher_id: String,
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub due_date: Option<DateTime<Utc>>,
  /// Submitted by groups rather than individual students
  #[serde(default)]
  pub is_group: bool,
  #[serde(default = "default_max_score")]
  pub max_score: f64,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub created_at: Option<DateTime<Utc>>,
}

impl Assignment {
  pub fn is_past_due(&self, at: DateTime<Utc>) -> bool {
    self.due_date.is_some_and(|due| at > due)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
  #[default]
  Submitted,
  Late,
  Graded,
}

impl std::fmt::Display for SubmissionStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      SubmissionStatus::Submitted => "submitted",
      SubmissionStatus::Late => "late",
      SubmissionStatus::Graded => "graded",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
  #[serde(default)]
  pub id: String,
  pub assignment_id: String,
  pub class_id: String,
  pub student_id: String,
  #[serde(default)]
  pub content: String,
  /// Download URLs of uploaded files
  #[serde(default)]
  pub attachments: Vec<String>,
  #[serde(default)]
  pub status: SubmissionStatus,
  #[serde(default)]
  pub grade: Option<f64>,
  #[serde(default)]
  pub feedback: Option<String>,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub submitted_at: Option<DateTime<Utc>>,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub graded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
  #[serde(default)]
  pub id: String,
  pub class_id: String,
  pub name: String,
  #[serde(default)]
  pub member_ids: Vec<String>,
  #[serde(default)]
  pub created_by: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSubmission {
  #[serde(default)]
  pub id: String,
  pub assignment_id: String,
  pub class_id: String,
  pub group_id: String,
  pub submitted_by: String,
  #[serde(default)]
  pub content: String,
  #[serde(default)]
  pub attachments: Vec<String>,
  #[serde(default)]
  pub status: SubmissionStatus,
  #[serde(default)]
  pub grade: Option<f64>,
  #[serde(default)]
  pub feedback: Option<String>,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub submitted_at: Option<DateTime<Utc>>,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub graded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
  #[default]
  Event,
  Lesson,
  Exam,
  Holiday,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
  #[serde(default)]
  pub id: String,
  /// User who created the event
  pub owner_id: String,
  /// Class-wide event when set, personal otherwise
  #[serde(default)]
  pub class_id: Option<String>,
  pub title: String,
  #[serde(default)]
  pub description: String,
  #[serde(serialize_with = "timestamp::serialize")]
  pub start: DateTime<Utc>,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub end: Option<DateTime<Utc>>,
  #[serde(default)]
  pub kind: EventKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
  #[serde(default)]
  pub id: String,
  pub class_id: String,
  pub sender_id: String,
  #[serde(default)]
  pub sender_name: String,
  pub text: String,
  #[serde(default, serialize_with = "timestamp::option::serialize")]
  pub sent_at: Option<DateTime<Utc>>,
}

/// What a calendar entry was built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CalendarSource {
  Deadline { assignment_id: String },
  Event { event_id: String, kind: EventKind },
}

/// One row of the aggregated calendar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEntry {
  pub title: String,
  #[serde(serialize_with = "timestamp::serialize")]
  pub start: DateTime<Utc>,
  #[serde(serialize_with = "timestamp::option::serialize")]
  pub end: Option<DateTime<Utc>>,
  pub class_id: Option<String>,
  pub source: CalendarSource,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_assignment_defaults_and_camel_case() {
    let a: Assignment = serde_json::from_value(json!({
      "id": "a1",
      "classId": "c1",
      "teacherId": "t1",
      "title": "Lab report",
      "dueDate": "2026-11-01T09:00:00Z"
    }))
    .unwrap();

    assert_eq!(a.max_score, 100.0);
    assert!(!a.is_group);
    assert!(a.is_past_due("2026-11-02T00:00:00Z".parse().unwrap()));
    assert!(!a.is_past_due("2026-10-30T00:00:00Z".parse().unwrap()));
    assert_eq!(Assignment::COLLECTION, "assignments");
  }

  #[test]
  fn test_enums_are_lowercase_on_the_wire() {
    let member = ClassMember {
      class_id: "c1".into(),
      user_id: "u1".into(),
      role: Role::Teacher,
      ..Default::default()
    };
    let value = serde_json::to_value(&member).unwrap();
    assert_eq!(value["role"], "teacher");
    assert_eq!(value["classId"], "c1");
  }

  #[test]
  fn test_timestamps_serialize_with_fixed_precision() {
    let message = ChatMessage {
      class_id: "c1".into(),
      sender_id: "s1".into(),
      text: "hi".into(),
      sent_at: Some("2099-01-01T00:00:00Z".parse().unwrap()),
      ..Default::default()
    };
    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["sentAt"], "2099-01-01T00:00:00.000000000Z");

    let back: ChatMessage = serde_json::from_value(value).unwrap();
    assert_eq!(back, message);

    let unsent = ChatMessage { sent_at: None, ..message };
    assert!(serde_json::to_value(&unsent).unwrap()["sentAt"].is_null());
  }
}
