//! Grade export.

use crate::cache::CacheStorage;
use crate::error::{Result, SyncError};

use super::client::LmsClient;
use super::models::Submission;

const HEADER: [&str; 5] = ["student_id", "status", "grade", "feedback", "submitted_at"];

impl<S: CacheStorage + 'static> LmsClient<S> {
  /// CSV of every submission to an assignment, ordered by student id.
  pub async fn export_grades_csv(&self, assignment_id: &str) -> Result<String> {
    let mut submissions = self.submissions(assignment_id).await?;
    submissions.sort_by(|a, b| a.student_id.cmp(&b.student_id));
    tracing::debug!(
      "Exporting {} submissions of {}",
      submissions.len(),
      assignment_id
    );
    grades_csv(&submissions)
  }
}

pub fn grades_csv(submissions: &[Submission]) -> Result<String> {
  let mut wtr = csv::Writer::from_writer(vec![]);
  wtr.write_record(HEADER)?;

  for submission in submissions {
    wtr.write_record([
      submission.student_id.clone(),
      submission.status.to_string(),
      submission.grade.map(|g| g.to_string()).unwrap_or_default(),
      submission.feedback.clone().unwrap_or_default(),
      submission
        .submitted_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_default(),
    ])?;
  }

  let data = wtr
    .into_inner()
    .map_err(|e| SyncError::Export(e.to_string()))?;
  String::from_utf8(data).map_err(|e| SyncError::Export(e.to_string()))
}
