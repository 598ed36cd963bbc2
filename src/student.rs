use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;

use crate::error::{Error, Result};
use crate::utils::now;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudentInfo {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One course a student is enrolled in, with how far they got.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StudentCourse {
    pub enrollment_id: i64,
    pub course_id: i64,
    pub title: String,
    pub progress_percentage: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

pub async fn get_student_list(database: &SqlitePool) -> Result<Vec<StudentInfo>> {
    let students = sqlx::query_as::<_, StudentInfo>(
        "SELECT id, name, email, created_at FROM student ORDER BY id",
    )
    .fetch_all(database)
    .await?;
    Ok(students)
}

pub async fn get_student(database: &SqlitePool, id: i64) -> Result<StudentInfo> {
    sqlx::query_as::<_, StudentInfo>("SELECT id, name, email, created_at FROM student WHERE id = ?")
        .bind(id)
        .fetch_optional(database)
        .await?
        .ok_or_else(|| Error::not_found("student", id))
}

pub async fn create_student(database: &SqlitePool, name: &str, email: &str) -> Result<i64> {
    if name.trim().is_empty() || !email.contains('@') {
        return Err(Error::InvalidContent(format!(
            "invalid student {name} <{email}>"
        )));
    }
    let student = sqlx::query("INSERT INTO student (name, email, created_at) VALUES (?, ?, ?)")
        .bind(name.trim())
        .bind(email.trim())
        .bind(now())
        .execute(database)
        .await?;
    info!("created student {}-{}", student.last_insert_rowid(), name);
    Ok(student.last_insert_rowid())
}

pub async fn delete_student(database: &SqlitePool, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM student WHERE id = ?")
        .bind(id)
        .execute(database)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found("student", id));
    }
    Ok(())
}

pub async fn get_student_courses(database: &SqlitePool, id: i64) -> Result<Vec<StudentCourse>> {
    let courses = sqlx::query_as::<_, StudentCourse>(
        "SELECT enrollment.id AS enrollment_id, course.id AS course_id, course.title, \
                COALESCE(course_progress.progress_percentage, 0.0) AS progress_percentage, enrollment.completed_at \
         FROM enrollment \
         INNER JOIN course ON course.id = enrollment.course_id \
         LEFT JOIN course_progress ON course_progress.enrollment_id = enrollment.id \
         WHERE enrollment.student_id = ? ORDER BY enrollment.enrolled_at, enrollment.id",
    )
    .bind(id)
    .fetch_all(database)
    .await?;
    Ok(courses)
}
