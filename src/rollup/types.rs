use serde::Serialize;

/// Per-subject materialized aggregates for one reporting period.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubjectRollup {
    pub subject_id: String,
    pub period_start: String,
    pub period_end: String,
    pub total_sessions: i64,
    /// Sum of per-session duration; sessions with no recorded duration are
    /// counted in `total_sessions` but contribute nothing here.
    pub total_hours: f64,
    pub active_tutors: i64,
    pub active_students: i64,
    /// active_students / active_tutors; 0 when there are no active tutors.
    pub student_to_tutor_ratio: f64,
    pub average_session_rating: f64,
    /// Feedback rows per session, as a percentage; 0 when there are no sessions.
    pub feedback_response_rate: f64,
}

/// Per-tutor-per-subject aggregates, scoped to completed sessions only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TutorRollup {
    pub tutor_id: String,
    pub subject_id: String,
    pub period_start: String,
    pub period_end: String,
    pub sessions_conducted: i64,
    pub total_hours: f64,
    pub average_rating: f64,
    pub feedback_count: i64,
    pub unique_students_helped: i64,
    /// Students with more than one completed session in the bucket.
    pub repeat_students: i64,
}

/// Per-student-per-subject aggregates, scoped to completed sessions only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StudentRollup {
    pub student_id: String,
    pub subject_id: String,
    pub period_start: String,
    pub period_end: String,
    pub sessions_attended: i64,
    pub total_learning_hours: f64,
    /// Feedback authored by the student in the period, across all subjects.
    pub feedback_given_count: i64,
    pub self_reported_confidence: f64,
    pub self_reported_understanding: f64,
}

/// Institution-wide aggregates for one period, derived from subject rollups.
/// Active-user and gamification counters are carried but not computed here.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstitutionRollup {
    pub period_start: String,
    pub period_end: String,
    pub active_subjects: i64,
    pub total_sessions: i64,
    pub total_hours: f64,
    pub active_instructors: i64,
    pub active_tutors: i64,
    pub active_students: i64,
    pub average_session_rating: f64,
    pub points_awarded: i64,
    pub achievements_unlocked: i64,
}
