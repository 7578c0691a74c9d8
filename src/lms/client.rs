//! LMS client over the sync layer.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::backend::strip_id;
use crate::cache::{CacheStorage, TtlCache};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::query::{Direction, FilterOp, QuerySpec};
use crate::sync::{LiveQuery, SyncManager, WatchOptions};

use super::models::*;

/// Firestore caps the number of values in an `in` filter.
const MAX_IN_VALUES: usize = 30;

/// LMS client with transparent caching support.
///
/// Reads of static collections (profiles and classes by default) are served
/// from the cache while fresh. Every write drops the cached queries of the
/// collection it touched.
pub struct LmsClient<S: CacheStorage = TtlCache> {
  sync: SyncManager<S>,
  static_ttl: Duration,
  static_collections: BTreeSet<String>,
}

impl<S: CacheStorage> Clone for LmsClient<S> {
  fn clone(&self) -> Self {
    Self {
      sync: self.sync.clone(),
      static_ttl: self.static_ttl,
      static_collections: self.static_collections.clone(),
    }
  }
}

impl<S: CacheStorage + 'static> LmsClient<S> {
  pub fn new(sync: SyncManager<S>, config: &SyncConfig) -> Self {
    Self {
      sync,
      static_ttl: config.default_ttl,
      static_collections: config.static_collections.clone(),
    }
  }

  pub fn sync(&self) -> &SyncManager<S> {
    &self.sync
  }

  fn ttl_for(&self, collection: &str) -> Option<Duration> {
    self
      .static_collections
      .contains(&collection.to_lowercase())
      .then_some(self.static_ttl)
  }

  async fn list<R: Record>(&self, query: QuerySpec) -> Result<Vec<R>> {
    let result = self.sync.read(&query, self.ttl_for(R::COLLECTION)).await?;
    Ok(result.data)
  }

  async fn first<R: Record>(&self, query: QuerySpec) -> Result<Option<R>> {
    Ok(self.list(query.limit(1)).await?.into_iter().next())
  }

  async fn require<R: Record>(&self, id: &str) -> Result<R> {
    self
      .sync
      .read_one(R::COLLECTION, id)
      .await?
      .ok_or_else(|| SyncError::NotFound(format!("{}/{}", R::COLLECTION, id)))
  }

  /// Read every `R` whose `field` is one of `values`, in batches the backend accepts.
  async fn list_in<R: Record>(&self, field: &str, values: &[String]) -> Result<Vec<R>> {
    let mut records = Vec::new();
    for chunk in values.chunks(MAX_IN_VALUES) {
      let query = QuerySpec::collection(R::COLLECTION).filter(field, FilterOp::In, chunk.to_vec());
      records.extend(self.list::<R>(query).await?);
    }
    Ok(records)
  }

  async fn insert<R: Record>(&self, record: &R) -> Result<String> {
    let data = strip_id(serde_json::to_value(record)?);
    let id = self.sync.backend().add_document(R::COLLECTION, data).await?;
    self.sync.invalidate(R::COLLECTION);
    tracing::info!("Created {}/{}", R::COLLECTION, id);
    Ok(id)
  }

  async fn patch(&self, collection: &str, id: &str, patch: Value) -> Result<()> {
    self.sync.backend().update_document(collection, id, patch).await?;
    self.sync.invalidate(collection);
    tracing::info!("Updated {}/{}", collection, id);
    Ok(())
  }

  // ---------------------------------------------------------------------------
  // Reads
  // ---------------------------------------------------------------------------

  pub async fn profile(&self, user_id: &str) -> Result<UserProfile> {
    self
      .first(QuerySpec::collection(UserProfile::COLLECTION).where_eq("id", user_id))
      .await?
      .ok_or_else(|| SyncError::NotFound(format!("users/{}", user_id)))
  }

  pub async fn classes_for_teacher(&self, teacher_id: &str) -> Result<Vec<Class>> {
    self
      .list(
        QuerySpec::collection(Class::COLLECTION)
          .where_eq("teacherId", teacher_id)
          .order_by("name", Direction::Ascending),
      )
      .await
  }

  /// Classes the user has joined as a member, sorted by name.
  pub async fn classes_for_student(&self, user_id: &str) -> Result<Vec<Class>> {
    let memberships: Vec<ClassMember> = self
      .list(QuerySpec::collection(ClassMember::COLLECTION).where_eq("userId", user_id))
      .await?;
    let class_ids: Vec<String> = memberships
      .into_iter()
      .map(|m| m.class_id)
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect();

    let mut classes: Vec<Class> = self.list_in("id", &class_ids).await?;
    classes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(classes)
  }

  pub async fn class_members(&self, class_id: &str) -> Result<Vec<ClassMember>> {
    self
      .list(QuerySpec::collection(ClassMember::COLLECTION).where_eq("classId", class_id))
      .await
  }

  pub async fn is_member(&self, class_id: &str, user_id: &str) -> Result<bool> {
    let member: Option<ClassMember> = self
      .first(
        QuerySpec::collection(ClassMember::COLLECTION)
          .where_eq("classId", class_id)
          .where_eq("userId", user_id),
      )
      .await?;
    Ok(member.is_some())
  }

  pub async fn pending_join_requests(&self, class_id: &str) -> Result<Vec<JoinRequest>> {
    self.list(pending_requests_query(class_id)).await
  }

  /// Assignments of a class, earliest deadline first.
  pub async fn assignments(&self, class_id: &str) -> Result<Vec<Assignment>> {
    self.list(assignments_query(class_id)).await
  }

  pub async fn submissions(&self, assignment_id: &str) -> Result<Vec<Submission>> {
    self.list(submissions_query(assignment_id)).await
  }

  pub async fn student_submission(
    &self,
    assignment_id: &str,
    student_id: &str,
  ) -> Result<Option<Submission>> {
    self
      .first(submissions_query(assignment_id).where_eq("studentId", student_id))
      .await
  }

  pub async fn group_submissions(&self, assignment_id: &str) -> Result<Vec<GroupSubmission>> {
    self
      .list(QuerySpec::collection(GroupSubmission::COLLECTION).where_eq("assignmentId", assignment_id))
      .await
  }

  pub async fn groups(&self, class_id: &str) -> Result<Vec<Group>> {
    self
      .list(
        QuerySpec::collection(Group::COLLECTION)
          .where_eq("classId", class_id)
          .order_by("name", Direction::Ascending),
      )
      .await
  }

  pub async fn group_for_student(&self, class_id: &str, student_id: &str) -> Result<Option<Group>> {
    self
      .first(
        QuerySpec::collection(Group::COLLECTION)
          .where_eq("classId", class_id)
          .array_contains("memberIds", student_id),
      )
      .await
  }

  /// Chat history of a class in send order. With `limit`, only the newest
  /// `limit` messages are returned.
  pub async fn chat_log(&self, class_id: &str, limit: Option<usize>) -> Result<Vec<ChatMessage>> {
    match limit {
      Some(n) => {
        let query = QuerySpec::collection(ChatMessage::COLLECTION)
          .where_eq("classId", class_id)
          .order_by("sentAt", Direction::Descending)
          .limit(n);
        let mut messages: Vec<ChatMessage> = self.list(query).await?;
        messages.reverse();
        Ok(messages)
      }
      None => self.list(chat_query(class_id)).await,
    }
  }

  /// Deadlines and events visible to `user_id` that start within `[from, to)`.
  ///
  /// Covers assignment deadlines of every class the user teaches or attends,
  /// the user's own events and the class-wide events of those classes.
  pub async fn calendar(
    &self,
    user_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
  ) -> Result<Vec<CalendarEntry>> {
    if from >= to {
      return Err(SyncError::validation("calendar window must end after it starts"));
    }
    let in_window = |at: &DateTime<Utc>| *at >= from && *at < to;

    let mut classes: BTreeMap<String, Class> = BTreeMap::new();
    for class in self.classes_for_teacher(user_id).await? {
      classes.insert(class.id.clone(), class);
    }
    for class in self.classes_for_student(user_id).await? {
      classes.insert(class.id.clone(), class);
    }
    let class_ids: Vec<String> = classes.keys().cloned().collect();

    let mut entries = Vec::new();

    let assignments: Vec<Assignment> = self.list_in("classId", &class_ids).await?;
    for assignment in assignments {
      let Some(due) = assignment.due_date.filter(|d| in_window(d)) else {
        continue;
      };
      let class_name = classes
        .get(&assignment.class_id)
        .map(|c| c.name.as_str())
        .unwrap_or_default();
      entries.push(CalendarEntry {
        title: format!("{} ({})", assignment.title, class_name),
        start: due,
        end: None,
        class_id: Some(assignment.class_id),
        source: CalendarSource::Deadline {
          assignment_id: assignment.id,
        },
      });
    }

    let mut events: BTreeMap<String, CalendarEvent> = BTreeMap::new();
    let own: Vec<CalendarEvent> = self
      .list(QuerySpec::collection(CalendarEvent::COLLECTION).where_eq("ownerId", user_id))
      .await?;
    let shared: Vec<CalendarEvent> = self.list_in("classId", &class_ids).await?;
    for event in own.into_iter().chain(shared) {
      events.insert(event.id.clone(), event);
    }

    for event in events.into_values().filter(|e| in_window(&e.start)) {
      entries.push(CalendarEntry {
        title: event.title,
        start: event.start,
        end: event.end,
        class_id: event.class_id,
        source: CalendarSource::Event {
          event_id: event.id,
          kind: event.kind,
        },
      });
    }

    entries.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.title.cmp(&b.title)));
    Ok(entries)
  }

  // ---------------------------------------------------------------------------
  // Watches
  // ---------------------------------------------------------------------------

  /// Live query of `R`; static collections are served from the cache while fresh.
  pub fn watch<R: Record>(&self, query: QuerySpec) -> LiveQuery<R> {
    let options = match self.ttl_for(&query.collection) {
      Some(ttl) => WatchOptions::cached(ttl),
      None => WatchOptions::live(),
    };
    self.sync.live(query, options)
  }

  pub fn watch_assignments(&self, class_id: &str) -> LiveQuery<Assignment> {
    self.watch(assignments_query(class_id))
  }

  pub fn watch_submissions(&self, assignment_id: &str) -> LiveQuery<Submission> {
    self.watch(submissions_query(assignment_id))
  }

  pub fn watch_chat(&self, class_id: &str) -> LiveQuery<ChatMessage> {
    self.watch(chat_query(class_id))
  }

  pub fn watch_join_requests(&self, class_id: &str) -> LiveQuery<JoinRequest> {
    self.watch(pending_requests_query(class_id))
  }

  // ---------------------------------------------------------------------------
  // Writes
  // ---------------------------------------------------------------------------

  /// Create a class and enrol its teacher as the first member.
  pub async fn create_class(&self, name: &str, subject: &str, teacher_id: &str) -> Result<String> {
    let name = required(name, "class name")?;
    let class = Class {
      name,
      subject: subject.trim().to_string(),
      teacher_id: teacher_id.to_string(),
      created_at: Some(Utc::now()),
      ..Default::default()
    };
    let class_id = self.insert(&class).await?;

    let member = ClassMember {
      class_id: class_id.clone(),
      user_id: teacher_id.to_string(),
      role: Role::Teacher,
      joined_at: Some(Utc::now()),
      ..Default::default()
    };
    self.insert(&member).await?;
    Ok(class_id)
  }

  pub async fn create_assignment(&self, mut assignment: Assignment) -> Result<String> {
    assignment.title = required(&assignment.title, "assignment title")?;
    if !assignment.max_score.is_finite() || assignment.max_score <= 0.0 {
      return Err(SyncError::validation("max score must be greater than zero"));
    }

    let class: Class = self.require(&assignment.class_id).await?;
    if class.teacher_id != assignment.teacher_id {
      return Err(SyncError::validation(
        "only the class teacher can create assignments",
      ));
    }

    assignment.created_at.get_or_insert_with(Utc::now);
    self.insert(&assignment).await
  }

  /// Submit or resubmit individual work. Returns the submission id.
  ///
  /// Work handed in after the deadline is marked late. Graded work cannot be
  /// resubmitted.
  pub async fn submit(
    &self,
    assignment_id: &str,
    student_id: &str,
    content: &str,
    attachments: Vec<String>,
  ) -> Result<String> {
    check_work(content, &attachments)?;

    let assignment: Assignment = self.require(assignment_id).await?;
    if assignment.is_group {
      return Err(SyncError::validation("this assignment takes group submissions"));
    }
    if !self.is_member(&assignment.class_id, student_id).await? {
      return Err(SyncError::validation("student is not a member of the class"));
    }

    let now = Utc::now();
    let status = submission_status(&assignment, now);

    match self.student_submission(assignment_id, student_id).await? {
      Some(existing) if existing.status == SubmissionStatus::Graded => {
        Err(SyncError::validation("submission has already been graded"))
      }
      Some(existing) => {
        let patch = json!({
          "content": content,
          "attachments": attachments,
          "status": status,
          "submittedAt": timestamp::format(&now),
        });
        self.patch(Submission::COLLECTION, &existing.id, patch).await?;
        Ok(existing.id)
      }
      None => {
        let submission = Submission {
          assignment_id: assignment_id.to_string(),
          class_id: assignment.class_id,
          student_id: student_id.to_string(),
          content: content.to_string(),
          attachments,
          status,
          submitted_at: Some(now),
          ..Default::default()
        };
        self.insert(&submission).await
      }
    }
  }

  /// Submit or resubmit work on behalf of a group. Returns the submission id.
  pub async fn submit_group(
    &self,
    assignment_id: &str,
    group_id: &str,
    submitted_by: &str,
    content: &str,
    attachments: Vec<String>,
  ) -> Result<String> {
    check_work(content, &attachments)?;

    let assignment: Assignment = self.require(assignment_id).await?;
    if !assignment.is_group {
      return Err(SyncError::validation("this assignment takes individual submissions"));
    }
    let group: Group = self.require(group_id).await?;
    if group.class_id != assignment.class_id {
      return Err(SyncError::validation("group belongs to another class"));
    }
    if !group.member_ids.iter().any(|m| m == submitted_by) {
      return Err(SyncError::validation("only group members can submit"));
    }

    let now = Utc::now();
    let status = submission_status(&assignment, now);
    let existing: Option<GroupSubmission> = self
      .first(
        QuerySpec::collection(GroupSubmission::COLLECTION)
          .where_eq("assignmentId", assignment_id)
          .where_eq("groupId", group_id),
      )
      .await?;

    match existing {
      Some(existing) if existing.status == SubmissionStatus::Graded => {
        Err(SyncError::validation("submission has already been graded"))
      }
      Some(existing) => {
        let patch = json!({
          "content": content,
          "attachments": attachments,
          "status": status,
          "submittedBy": submitted_by,
          "submittedAt": timestamp::format(&now),
        });
        self.patch(GroupSubmission::COLLECTION, &existing.id, patch).await?;
        Ok(existing.id)
      }
      None => {
        let submission = GroupSubmission {
          assignment_id: assignment_id.to_string(),
          class_id: assignment.class_id,
          group_id: group_id.to_string(),
          submitted_by: submitted_by.to_string(),
          content: content.to_string(),
          attachments,
          status,
          submitted_at: Some(now),
          ..Default::default()
        };
        self.insert(&submission).await
      }
    }
  }

  pub async fn grade_submission(
    &self,
    submission_id: &str,
    grade: f64,
    feedback: Option<&str>,
  ) -> Result<()> {
    let submission: Submission = self.require(submission_id).await?;
    let assignment: Assignment = self.require(&submission.assignment_id).await?;
    check_grade(grade, assignment.max_score)?;
    self
      .patch(Submission::COLLECTION, submission_id, grade_patch(grade, feedback))
      .await
  }

  pub async fn grade_group_submission(
    &self,
    submission_id: &str,
    grade: f64,
    feedback: Option<&str>,
  ) -> Result<()> {
    let submission: GroupSubmission = self.require(submission_id).await?;
    let assignment: Assignment = self.require(&submission.assignment_id).await?;
    check_grade(grade, assignment.max_score)?;
    self
      .patch(GroupSubmission::COLLECTION, submission_id, grade_patch(grade, feedback))
      .await
  }

  pub async fn request_join(
    &self,
    class_id: &str,
    user_id: &str,
    message: Option<&str>,
  ) -> Result<String> {
    let class: Class = self.require(class_id).await?;
    if class.teacher_id == user_id || self.is_member(class_id, user_id).await? {
      return Err(SyncError::validation("already a member of this class"));
    }

    let pending: Option<JoinRequest> = self
      .first(pending_requests_query(class_id).where_eq("userId", user_id))
      .await?;
    if pending.is_some() {
      return Err(SyncError::validation("a join request is already pending"));
    }

    let request = JoinRequest {
      class_id: class_id.to_string(),
      user_id: user_id.to_string(),
      status: RequestStatus::Pending,
      message: message.map(str::trim).filter(|m| !m.is_empty()).map(String::from),
      requested_at: Some(Utc::now()),
      ..Default::default()
    };
    self.insert(&request).await
  }

  /// Approve a pending request and enrol the user. Returns the member id.
  ///
  /// The status update and the enrolment are separate writes; if the second
  /// fails the request stays approved without a membership.
  pub async fn approve_join_request(&self, request_id: &str) -> Result<String> {
    let request = self.pending_request(request_id).await?;
    self
      .patch(
        JoinRequest::COLLECTION,
        request_id,
        json!({ "status": RequestStatus::Approved }),
      )
      .await?;

    let member = ClassMember {
      class_id: request.class_id.clone(),
      user_id: request.user_id.clone(),
      role: Role::Student,
      joined_at: Some(Utc::now()),
      ..Default::default()
    };
    self.insert(&member).await.inspect_err(|e| {
      tracing::error!(
        "Join request {} approved but enrolling {} in {} failed: {}",
        request_id,
        request.user_id,
        request.class_id,
        e
      );
    })
  }

  pub async fn reject_join_request(&self, request_id: &str) -> Result<()> {
    self.pending_request(request_id).await?;
    self
      .patch(
        JoinRequest::COLLECTION,
        request_id,
        json!({ "status": RequestStatus::Rejected }),
      )
      .await
  }

  async fn pending_request(&self, request_id: &str) -> Result<JoinRequest> {
    let request: JoinRequest = self.require(request_id).await?;
    if request.status != RequestStatus::Pending {
      return Err(SyncError::validation("join request is no longer pending"));
    }
    Ok(request)
  }

  /// Create a group of class members. A student can be in at most one group
  /// per class.
  pub async fn create_group(
    &self,
    class_id: &str,
    name: &str,
    member_ids: &[String],
    created_by: &str,
  ) -> Result<String> {
    let name = required(name, "group name")?;
    let members: BTreeSet<String> = member_ids.iter().cloned().collect();
    if members.is_empty() {
      return Err(SyncError::validation("a group needs at least one member"));
    }

    let enrolled: BTreeSet<String> = self
      .class_members(class_id)
      .await?
      .into_iter()
      .map(|m| m.user_id)
      .collect();
    if let Some(outsider) = members.iter().find(|m| !enrolled.contains(*m)) {
      return Err(SyncError::validation(format!(
        "{} is not a member of the class",
        outsider
      )));
    }

    let grouped: BTreeSet<String> = self
      .groups(class_id)
      .await?
      .into_iter()
      .flat_map(|g| g.member_ids)
      .collect();
    if let Some(taken) = members.iter().find(|m| grouped.contains(*m)) {
      return Err(SyncError::validation(format!("{} is already in a group", taken)));
    }

    let group = Group {
      class_id: class_id.to_string(),
      name,
      member_ids: members.into_iter().collect(),
      created_by: created_by.to_string(),
      ..Default::default()
    };
    self.insert(&group).await
  }

  pub async fn post_message(
    &self,
    class_id: &str,
    sender: &UserProfile,
    text: &str,
  ) -> Result<String> {
    let text = required(text, "message text")?;
    let message = ChatMessage {
      class_id: class_id.to_string(),
      sender_id: sender.id.clone(),
      sender_name: sender.display_name.clone(),
      text,
      sent_at: Some(Utc::now()),
      ..Default::default()
    };
    self.insert(&message).await
  }

  pub async fn add_calendar_event(&self, mut event: CalendarEvent) -> Result<String> {
    event.title = required(&event.title, "event title")?;
    if event.end.is_some_and(|end| end < event.start) {
      return Err(SyncError::validation("event ends before it starts"));
    }
    self.insert(&event).await
  }

  /// Change the display name and/or avatar of a profile.
  pub async fn update_profile(
    &self,
    user_id: &str,
    display_name: Option<&str>,
    avatar_url: Option<&str>,
  ) -> Result<()> {
    let mut patch = Map::new();
    if let Some(name) = display_name {
      patch.insert("displayName".into(), required(name, "display name")?.into());
    }
    if let Some(url) = avatar_url {
      patch.insert("avatarUrl".into(), url.trim().into());
    }
    if patch.is_empty() {
      return Err(SyncError::validation("nothing to update"));
    }
    self
      .patch(UserProfile::COLLECTION, user_id, Value::Object(patch))
      .await
  }
}

fn assignments_query(class_id: &str) -> QuerySpec {
  QuerySpec::collection(Assignment::COLLECTION)
    .where_eq("classId", class_id)
    .order_by("dueDate", Direction::Ascending)
}

fn submissions_query(assignment_id: &str) -> QuerySpec {
  QuerySpec::collection(Submission::COLLECTION).where_eq("assignmentId", assignment_id)
}

fn chat_query(class_id: &str) -> QuerySpec {
  QuerySpec::collection(ChatMessage::COLLECTION)
    .where_eq("classId", class_id)
    .order_by("sentAt", Direction::Ascending)
}

fn pending_requests_query(class_id: &str) -> QuerySpec {
  QuerySpec::collection(JoinRequest::COLLECTION)
    .where_eq("classId", class_id)
    .where_eq("status", "pending")
}

fn required(value: &str, what: &str) -> Result<String> {
  let trimmed = value.trim();
  if trimmed.is_empty() {
    return Err(SyncError::validation(format!("{} must not be empty", what)));
  }
  Ok(trimmed.to_string())
}

fn check_work(content: &str, attachments: &[String]) -> Result<()> {
  if content.trim().is_empty() && attachments.is_empty() {
    return Err(SyncError::validation(
      "a submission needs text or at least one attachment",
    ));
  }
  Ok(())
}

fn check_grade(grade: f64, max_score: f64) -> Result<()> {
  if !grade.is_finite() || grade < 0.0 || grade > max_score {
    return Err(SyncError::validation(format!(
      "grade must be between 0 and {}",
      max_score
    )));
  }
  Ok(())
}

fn submission_status(assignment: &Assignment, at: DateTime<Utc>) -> SubmissionStatus {
  if assignment.is_past_due(at) {
    SubmissionStatus::Late
  } else {
    SubmissionStatus::Submitted
  }
}

fn grade_patch(grade: f64, feedback: Option<&str>) -> Value {
  json!({
    "grade": grade,
    "feedback": feedback.map(str::trim).filter(|f| !f.is_empty()),
    "status": SubmissionStatus::Graded,
    "gradedAt": timestamp::format(&Utc::now()),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::MemoryBackend;
  use crate::cache::CacheLayer;
  use crate::error::ErrorKind;
  use crate::retry::RetryPolicy;
  use std::sync::Arc;

  fn client(backend: &MemoryBackend) -> LmsClient {
    let cache = CacheLayer::new(TtlCache::new(64)).with_retry(RetryPolicy::none());
    let sync = SyncManager::new(Arc::new(backend.clone()), cache);
    LmsClient::new(sync, &SyncConfig::default())
  }

  fn seed(backend: &MemoryBackend) {
    backend
      .insert(
        "users",
        "t1",
        json!({"displayName": "Ms. Rivera", "email": "rivera@school.test", "role": "teacher"}),
      )
      .unwrap();
    backend
      .insert(
        "users",
        "s1",
        json!({"displayName": "Sam", "email": "sam@school.test", "role": "student"}),
      )
      .unwrap();
    backend
      .insert("classes", "c1", json!({"name": "Biology", "teacherId": "t1"}))
      .unwrap();
    backend
      .insert(
        "classMembers",
        "m1",
        json!({"classId": "c1", "userId": "s1", "role": "student"}),
      )
      .unwrap();
    backend
      .insert(
        "assignments",
        "a1",
        json!({
          "classId": "c1",
          "teacherId": "t1",
          "title": "Cell diagram",
          "dueDate": "2099-01-10T09:00:00Z",
          "maxScore": 20.0
        }),
      )
      .unwrap();
  }

  fn kind<T: std::fmt::Debug>(result: Result<T>) -> ErrorKind {
    result.unwrap_err().kind()
  }

  #[tokio::test]
  async fn test_profile_is_cached_until_written() {
    let backend = MemoryBackend::new();
    seed(&backend);
    let lms = client(&backend);

    assert_eq!(lms.profile("s1").await.unwrap().display_name, "Sam");
    let reads = backend.read_count();
    assert_eq!(lms.profile("s1").await.unwrap().display_name, "Sam");
    assert_eq!(backend.read_count(), reads);

    lms.update_profile("s1", Some("  Samira "), None).await.unwrap();
    assert_eq!(lms.profile("s1").await.unwrap().display_name, "Samira");
    assert_eq!(kind(lms.profile("nobody").await), ErrorKind::NotFound);
  }

  #[tokio::test]
  async fn test_classes_for_student_and_teacher() {
    let backend = MemoryBackend::new();
    seed(&backend);
    let lms = client(&backend);

    let taught = lms.classes_for_teacher("t1").await.unwrap();
    assert_eq!(taught.len(), 1);
    let attended = lms.classes_for_student("s1").await.unwrap();
    assert_eq!(attended[0].id, "c1");
    assert!(lms.classes_for_student("t1").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_submit_then_grade_within_max_score() {
    let backend = MemoryBackend::new();
    seed(&backend);
    let lms = client(&backend);

    assert_eq!(
      kind(lms.submit("a1", "s1", "   ", vec![]).await),
      ErrorKind::Validation
    );
    assert_eq!(
      kind(lms.submit("a1", "stranger", "hi", vec![]).await),
      ErrorKind::Validation
    );

    let id = lms.submit("a1", "s1", "first draft", vec![]).await.unwrap();
    let again = lms.submit("a1", "s1", "final", vec![]).await.unwrap();
    assert_eq!(id, again);

    let submission = lms.student_submission("a1", "s1").await.unwrap().unwrap();
    assert_eq!(submission.content, "final");
    assert_eq!(submission.status, SubmissionStatus::Submitted);

    assert_eq!(
      kind(lms.grade_submission(&id, 21.0, None).await),
      ErrorKind::Validation
    );
    assert_eq!(
      kind(lms.grade_submission(&id, -1.0, None).await),
      ErrorKind::Validation
    );
    lms.grade_submission(&id, 18.5, Some("Clear labels")).await.unwrap();

    let graded = &lms.submissions("a1").await.unwrap()[0];
    assert_eq!(graded.grade, Some(18.5));
    assert_eq!(graded.status, SubmissionStatus::Graded);
    assert_eq!(
      kind(lms.submit("a1", "s1", "too late", vec![]).await),
      ErrorKind::Validation
    );
  }

  #[tokio::test]
  async fn test_late_submission_is_marked_late() {
    let backend = MemoryBackend::new();
    seed(&backend);
    backend
      .insert(
        "assignments",
        "a0",
        json!({"classId": "c1", "teacherId": "t1", "title": "Past", "dueDate": "2000-01-01T00:00:00Z"}),
      )
      .unwrap();
    let lms = client(&backend);

    lms
      .submit("a0", "s1", "", vec!["https://files.test/essay.pdf".into()])
      .await
      .unwrap();
    let submission = lms.student_submission("a0", "s1").await.unwrap().unwrap();
    assert_eq!(submission.status, SubmissionStatus::Late);
  }

  #[tokio::test]
  async fn test_join_request_flow() {
    let backend = MemoryBackend::new();
    seed(&backend);
    let lms = client(&backend);

    assert_eq!(
      kind(lms.request_join("c1", "s1", None).await),
      ErrorKind::Validation
    );
    assert_eq!(
      kind(lms.request_join("c1", "t1", None).await),
      ErrorKind::Validation
    );

    let request = lms.request_join("c1", "s2", Some("hi")).await.unwrap();
    assert_eq!(
      kind(lms.request_join("c1", "s2", None).await),
      ErrorKind::Validation
    );
    assert_eq!(lms.pending_join_requests("c1").await.unwrap().len(), 1);

    lms.approve_join_request(&request).await.unwrap();
    assert!(lms.is_member("c1", "s2").await.unwrap());
    assert!(lms.pending_join_requests("c1").await.unwrap().is_empty());
    assert_eq!(
      kind(lms.reject_join_request(&request).await),
      ErrorKind::Validation
    );
  }

  #[tokio::test]
  async fn test_create_group_checks_membership() {
    let backend = MemoryBackend::new();
    seed(&backend);
    let lms = client(&backend);

    assert_eq!(
      kind(lms.create_group("c1", "Team", &["ghost".into()], "t1").await),
      ErrorKind::Validation
    );
    lms.create_group("c1", "Team A", &["s1".into()], "t1").await.unwrap();
    assert_eq!(
      kind(lms.create_group("c1", "Team B", &["s1".into()], "t1").await),
      ErrorKind::Validation
    );

    let group = lms.group_for_student("c1", "s1").await.unwrap().unwrap();
    assert_eq!(group.name, "Team A");
  }

  #[tokio::test]
  async fn test_calendar_merges_deadlines_and_events_in_window() {
    let backend = MemoryBackend::new();
    seed(&backend);
    backend
      .insert(
        "calendarEvents",
        "e1",
        json!({"ownerId": "t1", "classId": "c1", "title": "Field trip", "start": "2099-01-05T08:00:00Z", "kind": "event"}),
      )
      .unwrap();
    backend
      .insert(
        "calendarEvents",
        "e2",
        json!({"ownerId": "s1", "title": "Dentist", "start": "2099-02-01T08:00:00Z"}),
      )
      .unwrap();
    let lms = client(&backend);

    let from: DateTime<Utc> = "2099-01-01T00:00:00Z".parse().unwrap();
    let to: DateTime<Utc> = "2099-01-31T00:00:00Z".parse().unwrap();
    let entries = lms.calendar("s1", from, to).await.unwrap();

    let titles: Vec<&str> = entries.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, vec!["Field trip", "Cell diagram (Biology)"]);
    assert!(matches!(entries[1].source, CalendarSource::Deadline { .. }));
    assert_eq!(kind(lms.calendar("s1", to, from).await), ErrorKind::Validation);
  }

  #[tokio::test]
  async fn test_chat_log_keeps_newest() {
    let backend = MemoryBackend::new();
    seed(&backend);
    let lms = client(&backend);
    let sam = lms.profile("s1").await.unwrap();

    assert_eq!(
      kind(lms.post_message("c1", &sam, " \n").await),
      ErrorKind::Validation
    );
    for (id, at) in [("x1", "01"), ("x2", "02"), ("x3", "03")] {
      backend
        .insert(
          "chatMessages",
          id,
          json!({"classId": "c1", "senderId": "s1", "text": id, "sentAt": format!("2099-01-{}T00:00:00Z", at)}),
        )
        .unwrap();
    }

    let newest: Vec<String> = lms
      .chat_log("c1", Some(2))
      .await
      .unwrap()
      .into_iter()
      .map(|m| m.text)
      .collect();
    assert_eq!(newest, vec!["x2", "x3"]);
  }

  #[tokio::test]
  async fn test_chat_log_orders_mixed_precision_timestamps() {
    let backend = MemoryBackend::new();
    seed(&backend);
    let lms = client(&backend);

    for (id, at) in [("m1", "2099-01-01T00:00:00Z"), ("m2", "2099-01-01T00:00:00.500Z")] {
      backend
        .insert(
          "chatMessages",
          id,
          json!({"classId": "c1", "senderId": "s1", "text": id, "sentAt": at}),
        )
        .unwrap();
    }

    let texts = |log: Vec<ChatMessage>| log.into_iter().map(|m| m.text).collect::<Vec<_>>();
    assert_eq!(texts(lms.chat_log("c1", None).await.unwrap()), vec!["m1", "m2"]);
    assert_eq!(texts(lms.chat_log("c1", Some(1)).await.unwrap()), vec!["m2"]);
  }

  #[tokio::test]
  async fn test_watch_assignments_sees_new_assignment() {
    let backend = MemoryBackend::new();
    seed(&backend);
    let lms = client(&backend);

    let mut live = lms.watch_assignments("c1");
    assert!(live.next_update().await);
    assert_eq!(live.data().map(|d| d.len()), Some(1));

    let new = Assignment {
      id: String::new(),
      class_id: "c1".into(),
      teacher_id: "t1".into(),
      title: "Microscope lab".into(),
      description: String::new(),
      due_date: None,
      is_group: false,
      max_score: 10.0,
      created_at: None,
    };
    lms.create_assignment(new.clone()).await.unwrap();
    assert!(live.next_update().await);
    assert_eq!(live.data().map(|d| d.len()), Some(2));

    let mut stranger = new;
    stranger.teacher_id = "s1".into();
    assert_eq!(
      kind(lms.create_assignment(stranger).await),
      ErrorKind::Validation
    );
  }
}
