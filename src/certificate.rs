//! Certificates for completed enrollments. One per enrollment; issuing again
//! hands back the existing one.

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::Serialize;
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{info, warn};

use crate::catalog::course::get_course;
use crate::enrollment::get_enrollment;
use crate::error::{Error, Result};
use crate::progress::{
    ProgressEngine, course_counts, course_topic_counts, initialize_in, load_course_progress, stamp_completed,
    write_course_progress,
};
use crate::utils::now;

const CERTIFICATE_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CERTIFICATE_ID_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Certificate {
    pub id: i64,
    pub enrollment_id: i64,
    /// Public identifier printed on the document
    pub certificate_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_on: OffsetDateTime,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub enum CertificateIssue {
    Issued(Certificate),
    AlreadyCertified(Certificate),
}

impl CertificateIssue {
    pub fn certificate(&self) -> &Certificate {
        match self {
            CertificateIssue::Issued(c) | CertificateIssue::AlreadyCertified(c) => c,
        }
    }
}

/// Turns certificate data into a document.
pub trait CertificateRenderer: Send + Sync {
    /// File extension of the rendered document, without the dot.
    fn extension(&self) -> &str;

    fn render(
        &self,
        student_name: &str,
        course_title: &str,
        issue_date: OffsetDateTime,
        certificate_id: &str,
    ) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextRenderer;

impl CertificateRenderer for PlainTextRenderer {
    fn extension(&self) -> &str {
        "txt"
    }

    fn render(
        &self,
        student_name: &str,
        course_title: &str,
        issue_date: OffsetDateTime,
        certificate_id: &str,
    ) -> anyhow::Result<Vec<u8>> {
        let date = issue_date.format(format_description!("[year]-[month]-[day]"))?;
        Ok(format!(
            "CERTIFICATE OF COMPLETION\n\n\
             This certifies that\n\n    {student_name}\n\n\
             has completed the course\n\n    {course_title}\n\n\
             Issued on {date}\nCertificate ID: {certificate_id}\n"
        )
        .into_bytes())
    }
}

pub fn generate_certificate_id() -> String {
    let mut rng = rand::thread_rng();
    let code: String = (0..CERTIFICATE_ID_LEN)
        .map(|_| CERTIFICATE_ID_CHARSET[rng.gen_range(0..CERTIFICATE_ID_CHARSET.len())] as char)
        .collect();
    format!("CERT-{code}")
}

const CERTIFICATE_COLUMNS: &str = "id, enrollment_id, certificate_id, issued_on, file_path";

async fn enrollment_certificate(conn: &mut SqliteConnection, enrollment_id: i64) -> Result<Option<Certificate>> {
    let certificate = sqlx::query_as::<_, Certificate>(&format!(
        "SELECT {CERTIFICATE_COLUMNS} FROM certificate WHERE enrollment_id = ?"
    ))
    .bind(enrollment_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(certificate)
}

async fn unused_certificate_id(conn: &mut SqliteConnection) -> Result<String> {
    loop {
        let candidate = generate_certificate_id();
        let taken: Option<i64> = sqlx::query_scalar("SELECT id FROM certificate WHERE certificate_id = ?")
            .bind(&candidate)
            .fetch_optional(&mut *conn)
            .await?;
        if taken.is_none() {
            return Ok(candidate);
        }
        warn!("certificate id {} already taken, drawing again", candidate);
    }
}

pub struct CertificateService<R> {
    progress: ProgressEngine,
    renderer: R,
    directory: PathBuf,
}

impl<R: CertificateRenderer> CertificateService<R> {
    pub fn new(progress: ProgressEngine, renderer: R, directory: impl AsRef<Path>) -> Self {
        Self {
            progress,
            renderer,
            directory: directory.as_ref().to_path_buf(),
        }
    }

    /// Issue the certificate of a completed enrollment.
    ///
    /// The enrollment qualifies once the course was marked completed, its
    /// sections roll up to complete, or every counted topic row is done.
    /// Issuing also finalizes the enrollment and its course progress if they
    /// were not marked complete yet.
    pub async fn issue_certificate(&self, enrollment_id: i64) -> Result<CertificateIssue> {
        let _guard = self.progress.locks().lock(enrollment_id).await;
        let mut tx = self.progress.database().begin().await?;
        if let Some(existing) = enrollment_certificate(&mut tx, enrollment_id).await? {
            return Ok(CertificateIssue::AlreadyCertified(existing));
        }
        let enrollment = get_enrollment(&mut tx, enrollment_id).await?;
        let course = get_course(&mut tx, enrollment.course_id).await?;
        let student_name: String = sqlx::query_scalar("SELECT name FROM student WHERE id = ?")
            .bind(enrollment.student_id)
            .fetch_one(&mut *tx)
            .await?;

        let course_progress = match load_course_progress(&mut tx, enrollment.id).await? {
            Some(progress) => progress,
            None => {
                warn!("progress missing for enrollment {}, initializing", enrollment.id);
                initialize_in(&mut tx, &enrollment).await?
            }
        };
        let sections = course_counts(&mut tx, course_progress.id, course.id).await?;
        let topics = course_topic_counts(&mut tx, course_progress.id, course.id).await?;
        let complete = enrollment.completed_at.is_some()
            || course_progress.completed
            || (sections.total > 0 && sections.is_complete())
            || (topics.total > 0 && topics.is_complete());
        if !complete {
            let (completed, total) = if topics.required_total > 0 {
                (topics.required_done, topics.required_total)
            } else {
                (topics.done, topics.total)
            };
            return Err(Error::CourseNotComplete { completed, total });
        }

        let issued_on = now();
        let certificate_id = unused_certificate_id(&mut tx).await?;
        let document = self
            .renderer
            .render(&student_name, &course.title, issued_on, &certificate_id)
            .map_err(Error::Fatal)?;
        tokio::fs::create_dir_all(&self.directory).await?;
        let path = self
            .directory
            .join(format!("{certificate_id}.{}", self.renderer.extension()));
        tokio::fs::write(&path, document).await?;

        let id = sqlx::query(
            "INSERT INTO certificate (enrollment_id, certificate_id, issued_on, file_path) VALUES (?, ?, ?, ?)",
        )
        .bind(enrollment.id)
        .bind(&certificate_id)
        .bind(issued_on)
        .bind(path.to_string_lossy().into_owned())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        if stamp_completed(&mut tx, enrollment.id, issued_on).await? {
            info!("enrollment {} completed on certificate issue", enrollment.id);
        }
        if !course_progress.completed || course_progress.progress_percentage < 100.0 {
            write_course_progress(&mut tx, &course_progress, 100.0, true).await?;
        }
        let certificate = sqlx::query_as::<_, Certificate>(&format!(
            "SELECT {CERTIFICATE_COLUMNS} FROM certificate WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(
            "issued certificate {} to {} for course {}-{}",
            certificate.certificate_id, student_name, course.id, course.title
        );
        Ok(CertificateIssue::Issued(certificate))
    }

    /// Look up a certificate by its public id on behalf of `student_id`.
    pub async fn find_certificate(&self, certificate_id: &str, student_id: i64) -> Result<Certificate> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT enrollment.student_id FROM certificate \
             INNER JOIN enrollment ON enrollment.id = certificate.enrollment_id \
             WHERE certificate.certificate_id = ?",
        )
        .bind(certificate_id)
        .fetch_optional(self.progress.database())
        .await?;
        match row {
            None => Err(Error::not_found("certificate", certificate_id)),
            Some((owner,)) if owner != student_id => {
                Err(Error::Forbidden(format!("certificate {certificate_id}")))
            }
            Some(_) => {
                let certificate = sqlx::query_as::<_, Certificate>(&format!(
                    "SELECT {CERTIFICATE_COLUMNS} FROM certificate WHERE certificate_id = ?"
                ))
                .bind(certificate_id)
                .fetch_one(self.progress.database())
                .await?;
                Ok(certificate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{enroll, import, setup, student, two_by_two};

    #[test]
    fn certificate_ids_are_opaque() {
        let id = generate_certificate_id();
        assert_eq!(id.len(), 5 + CERTIFICATE_ID_LEN);
        let code = id.strip_prefix("CERT-").unwrap();
        assert!(code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
        assert_ne!(id, generate_certificate_id());
    }

    #[tokio::test]
    async fn issues_once_for_a_completed_course() {
        let dir = tempfile::tempdir().unwrap();
        let (database, progress) = setup().await;
        let tree = import(&database, &two_by_two("unlocked")).await;
        let student_id = student(&database, "ana").await;
        let enrollment = enroll(&progress, student_id, tree.course_id).await;
        let service = CertificateService::new(progress.clone(), PlainTextRenderer, dir.path());

        let err = service.issue_certificate(enrollment.id).await.unwrap_err();
        assert!(matches!(err, Error::CourseNotComplete { completed: 0, total: 4 }));

        for topic_id in tree.topics.iter().flatten() {
            progress.mark_topic_completed(student_id, *topic_id).await.unwrap();
        }
        let issued = service.issue_certificate(enrollment.id).await.unwrap();
        let CertificateIssue::Issued(certificate) = issued else {
            panic!("expected a new certificate");
        };
        assert!(certificate.certificate_id.starts_with("CERT-"));
        let text = std::fs::read_to_string(certificate.file_path.as_ref().unwrap()).unwrap();
        assert!(text.contains("ana"));
        assert!(text.contains("Two by two"));
        assert!(text.contains(&certificate.certificate_id));

        let again = service.issue_certificate(enrollment.id).await.unwrap();
        assert!(matches!(again, CertificateIssue::AlreadyCertified(ref c) if *c == certificate));
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM certificate")
            .fetch_one(&database)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let found = service
            .find_certificate(&certificate.certificate_id, student_id)
            .await
            .unwrap();
        assert_eq!(found, certificate);
        let other = student(&database, "ben").await;
        let err = service
            .find_certificate(&certificate.certificate_id, other)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        let err = service.find_certificate("CERT-NOPE", student_id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn verifies_topics_and_finalizes_progress() {
        let dir = tempfile::tempdir().unwrap();
        let (database, progress) = setup().await;
        let tree = import(&database, &two_by_two("unlocked")).await;
        let student_id = student(&database, "cy").await;
        let enrollment = enroll(&progress, student_id, tree.course_id).await;
        let service = CertificateService::new(progress.clone(), PlainTextRenderer, dir.path());

        // topic rows complete, flags left behind
        sqlx::query("UPDATE topic_progress SET completed = 1")
            .execute(&database)
            .await
            .unwrap();
        let issued = service.issue_certificate(enrollment.id).await.unwrap();
        assert!(matches!(issued, CertificateIssue::Issued(_)));

        let mut conn = database.acquire().await.unwrap();
        let enrollment = get_enrollment(&mut conn, enrollment.id).await.unwrap();
        assert!(enrollment.completed_at.is_some());
        let course = load_course_progress(&mut conn, enrollment.id).await.unwrap().unwrap();
        assert!(course.completed);
        assert_eq!(course.progress_percentage, 100.0);
    }

    #[tokio::test]
    async fn optional_section_does_not_block_a_completed_course() {
        let dir = tempfile::tempdir().unwrap();
        let (database, progress) = setup().await;
        let tree = import(
            &database,
            r#"
title = "Core and extras"
course_type = "unlocked"

[[section]]
title = "Core"
[[section.topic]]
title = "must"
is_required = true

[[section]]
title = "Extras"
is_required = false
[[section.topic]]
title = "bonus"
is_required = true
"#,
        )
        .await;
        let student_id = student(&database, "eve").await;
        let enrollment = enroll(&progress, student_id, tree.course_id).await;
        let done = progress
            .mark_topic_completed(student_id, tree.topics[0][0])
            .await
            .unwrap();
        assert!(done.course_completed);
        assert_eq!(done.progress_percentage, 100.0);

        let service = CertificateService::new(progress, PlainTextRenderer, dir.path());
        let issued = service.issue_certificate(enrollment.id).await.unwrap();
        assert!(matches!(issued, CertificateIssue::Issued(_)));
    }

    #[tokio::test]
    async fn empty_course_is_never_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (database, progress) = setup().await;
        let tree = import(&database, "title = \"Empty\"\n").await;
        let student_id = student(&database, "di").await;
        let enrollment = enroll(&progress, student_id, tree.course_id).await;
        let service = CertificateService::new(progress, PlainTextRenderer, dir.path());
        let err = service.issue_certificate(enrollment.id).await.unwrap_err();
        assert!(matches!(err, Error::CourseNotComplete { completed: 0, total: 0 }));
    }
}
