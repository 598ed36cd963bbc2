//! Enrollment lifecycle: free enrollment, paid enrollment through a payment
//! gateway, pause and resume.

pub mod payment;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use tracing::info;

use crate::catalog::course::get_course;
use crate::error::{Error, Result};
use crate::progress::{ProgressEngine, initialize_in};
use crate::utils::now;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    #[default]
    Active,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Enrollment {
    pub id: i64,
    pub student_id: i64,
    pub course_id: i64,
    pub status: EnrollmentStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub enrolled_at: OffsetDateTime,
    /// Set once, when the course is first completed
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub enum EnrollOutcome {
    Enrolled(Enrollment),
    AlreadyEnrolled(Enrollment),
}

impl EnrollOutcome {
    pub fn enrollment(&self) -> &Enrollment {
        match self {
            EnrollOutcome::Enrolled(e) | EnrollOutcome::AlreadyEnrolled(e) => e,
        }
    }
}

const ENROLLMENT_COLUMNS: &str = "id, student_id, course_id, status, enrolled_at, completed_at";

pub async fn find_enrollment(
    conn: &mut SqliteConnection,
    student_id: i64,
    course_id: i64,
) -> Result<Option<Enrollment>> {
    let enrollment = sqlx::query_as::<_, Enrollment>(&format!(
        "SELECT {ENROLLMENT_COLUMNS} FROM enrollment WHERE student_id = ? AND course_id = ?"
    ))
    .bind(student_id)
    .bind(course_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(enrollment)
}

pub async fn get_enrollment(conn: &mut SqliteConnection, enrollment_id: i64) -> Result<Enrollment> {
    sqlx::query_as::<_, Enrollment>(&format!(
        "SELECT {ENROLLMENT_COLUMNS} FROM enrollment WHERE id = ?"
    ))
    .bind(enrollment_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::not_found("enrollment", enrollment_id))
}

/// Create the enrollment and its progress rows in the caller's transaction.
/// An existing enrollment is returned as is.
pub(crate) async fn enroll_in(
    conn: &mut SqliteConnection,
    student_id: i64,
    course_id: i64,
) -> Result<EnrollOutcome> {
    let inserted = sqlx::query(
        "INSERT INTO enrollment (student_id, course_id, status, enrolled_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (student_id, course_id) DO NOTHING",
    )
    .bind(student_id)
    .bind(course_id)
    .bind(EnrollmentStatus::Active)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .rows_affected()
        == 1;
    let enrollment = find_enrollment(conn, student_id, course_id)
        .await?
        .ok_or_else(|| Error::not_found("enrollment", format!("{student_id}/{course_id}")))?;
    if !inserted {
        return Ok(EnrollOutcome::AlreadyEnrolled(enrollment));
    }
    initialize_in(conn, &enrollment).await?;
    Ok(EnrollOutcome::Enrolled(enrollment))
}

/// Enroll a student in a free course.
pub async fn enroll_free(progress: &ProgressEngine, student_id: i64, course_id: i64) -> Result<EnrollOutcome> {
    let mut tx = progress.database().begin().await?;
    let course = get_course(&mut tx, course_id).await?;
    if !course.is_free() {
        return Err(Error::PaymentRequired {
            course_id,
            price: course.price,
        });
    }
    sqlx::query("SELECT id FROM student WHERE id = ?")
        .bind(student_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found("student", student_id))?;
    let outcome = enroll_in(&mut tx, student_id, course_id).await?;
    tx.commit().await?;
    match &outcome {
        EnrollOutcome::Enrolled(e) => info!(
            "student {} enrolled in free course {}-{} as enrollment {}",
            student_id, course.id, course.title, e.id
        ),
        EnrollOutcome::AlreadyEnrolled(e) => info!(
            "student {} already enrolled in course {} as enrollment {}",
            student_id, course.id, e.id
        ),
    }
    Ok(outcome)
}

/// Pause or resume an enrollment. Paused enrollments cannot make progress.
pub async fn set_enrollment_status(
    progress: &ProgressEngine,
    enrollment_id: i64,
    status: EnrollmentStatus,
) -> Result<Enrollment> {
    let _guard = progress.locks().lock(enrollment_id).await;
    let mut conn = progress.database().acquire().await?;
    let result = sqlx::query("UPDATE enrollment SET status = ? WHERE id = ?")
        .bind(status)
        .bind(enrollment_id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found("enrollment", enrollment_id));
    }
    info!("enrollment {} is now {:?}", enrollment_id, status);
    get_enrollment(&mut conn, enrollment_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::authoring::{CourseDefinition, import_course};
    use crate::fixtures::{import, setup, student, two_by_two};

    #[tokio::test]
    async fn free_enrollment_is_unique_and_initialized() {
        let (database, progress) = setup().await;
        let tree = import(&database, &two_by_two("locked")).await;
        let student_id = student(&database, "ana").await;

        let first = enroll_free(&progress, student_id, tree.course_id).await.unwrap();
        let EnrollOutcome::Enrolled(enrollment) = first else {
            panic!("expected a new enrollment");
        };
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
        assert!(enrollment.completed_at.is_none());

        let second = enroll_free(&progress, student_id, tree.course_id).await.unwrap();
        assert!(matches!(second, EnrollOutcome::AlreadyEnrolled(ref e) if e.id == enrollment.id));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enrollment")
            .fetch_one(&database)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        let topics: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM topic_progress")
            .fetch_one(&database)
            .await
            .unwrap();
        assert_eq!(topics, 4);
    }

    #[tokio::test]
    async fn paid_course_needs_payment() {
        let (database, progress) = setup().await;
        let definition = CourseDefinition::from_toml("title = \"Paid\"\nprice = 25000\n").unwrap();
        let course_id = import_course(&database, &definition).await.unwrap();
        let student_id = student(&database, "ben").await;

        let err = enroll_free(&progress, student_id, course_id).await.unwrap_err();
        assert!(matches!(err, Error::PaymentRequired { price: 25000, .. }));
    }

    #[tokio::test]
    async fn paused_enrollment_blocks_progress() {
        let (database, progress) = setup().await;
        let tree = import(&database, &two_by_two("unlocked")).await;
        let student_id = student(&database, "cy").await;
        let outcome = enroll_free(&progress, student_id, tree.course_id).await.unwrap();
        let enrollment_id = outcome.enrollment().id;

        let paused = set_enrollment_status(&progress, enrollment_id, EnrollmentStatus::Paused)
            .await
            .unwrap();
        assert_eq!(paused.status, EnrollmentStatus::Paused);
        let err = progress
            .mark_topic_completed(student_id, tree.topics[0][0])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EnrollmentPaused(id) if id == enrollment_id));

        set_enrollment_status(&progress, enrollment_id, EnrollmentStatus::Active)
            .await
            .unwrap();
        progress
            .mark_topic_completed(student_id, tree.topics[0][0])
            .await
            .unwrap();
    }
}
