use sqlx::SqlitePool;
use tracing::info;

use crate::certificate::{CertificateRenderer, CertificateService, PlainTextRenderer};
use crate::config::Config;
use crate::db;
use crate::enrollment::payment::{PaymentEnrollment, PaymentGateway};
use crate::error::Result;
use crate::progress::ProgressEngine;
use crate::quiz::QuizEngine;

/// All engines of the platform sharing one database and one lock registry.
pub struct Server<R = PlainTextRenderer> {
    config: Config,
    progress: ProgressEngine,
    quiz: QuizEngine,
    certificates: CertificateService<R>,
}

impl Server<PlainTextRenderer> {
    /// Connect to the configured database and render certificates as text.
    pub async fn open(config: Config) -> Result<Self> {
        let database = db::connect(&config.database_url).await?;
        Ok(Self::new(config, database, PlainTextRenderer))
    }
}

impl<R: CertificateRenderer> Server<R> {
    pub fn new(config: Config, database: SqlitePool, renderer: R) -> Self {
        let progress = ProgressEngine::new(database);
        let certificates = CertificateService::new(progress.clone(), renderer, &config.certificate_dir);
        info!(
            "server ready, certificates go to {}",
            config.certificate_dir.display()
        );
        Self {
            quiz: QuizEngine::new(progress.clone()),
            progress,
            certificates,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &SqlitePool {
        self.progress.database()
    }

    pub fn progress(&self) -> &ProgressEngine {
        &self.progress
    }

    pub fn quiz(&self) -> &QuizEngine {
        &self.quiz
    }

    pub fn certificates(&self) -> &CertificateService<R> {
        &self.certificates
    }

    /// Paid enrollment through `gateway`, using the configured redirect and session lifetime.
    pub fn payments<G: PaymentGateway>(&self, gateway: G) -> PaymentEnrollment<G> {
        PaymentEnrollment::new(self.progress.clone(), gateway, self.config.payment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::authoring::{CourseDefinition, import_course};
    use crate::catalog::course::get_topic;
    use crate::catalog::quiz::quiz_questions;
    use crate::certificate::CertificateIssue;
    use crate::enrollment::{EnrollOutcome, enroll_free};
    use crate::quiz::QuizStart;
    use crate::student::create_student;

    const COURSE: &str = r#"
title = "Async Rust"
category = "Programming"
course_type = "locked"

[[section]]
title = "Futures"
[[section.topic]]
title = "Polling"
content_type = "article"
article_content = "A future does nothing until polled."
[[section.topic]]
title = "Checkpoint"
is_required = true
[section.topic.quiz]
name = "Futures quiz"
attempts_allowed = 2
passing_score = 100
[[section.topic.quiz.question]]
text = "What drives a future?"
answer = [{ text = "An executor", correct = true }, { text = "The compiler" }]

[[section]]
title = "Pinning"
[[section.topic]]
title = "Pin"
content_type = "video"
video_path = "videos/pin.mp4"
"#;

    #[tokio::test]
    async fn student_goes_from_enrollment_to_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            certificate_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let database = db::connect_memory().await.unwrap();
        let server = Server::new(config, database, PlainTextRenderer);

        let definition = CourseDefinition::from_toml(COURSE).unwrap();
        let course_id = import_course(server.database(), &definition).await.unwrap();
        let student_id = create_student(server.database(), "Ana", "ana@example.com")
            .await
            .unwrap();
        let EnrollOutcome::Enrolled(enrollment) =
            enroll_free(server.progress(), student_id, course_id).await.unwrap()
        else {
            panic!("expected a new enrollment");
        };

        let overview = server.progress().course_overview(student_id, course_id).await.unwrap();
        let polling = overview.resume_topic_id.unwrap();
        let checkpoint = overview.sections[0].topics[1].topic.id;
        let pin = overview.sections[1].topics[0].topic.id;
        server.progress().mark_topic_completed(student_id, polling).await.unwrap();

        let (quiz_id, question) = {
            let mut conn = server.database().acquire().await.unwrap();
            let quiz = get_topic(&mut conn, checkpoint).await.unwrap().quiz.unwrap();
            let question = quiz_questions(&mut conn, quiz.id).await.unwrap().remove(0);
            (quiz.id, question)
        };
        let QuizStart::Started(attempt) = server.quiz().start_quiz(student_id, quiz_id).await.unwrap() else {
            panic!("expected a new attempt");
        };
        let right = question.correct_answer().unwrap().id;
        server
            .quiz()
            .submit_answer(student_id, attempt.id, question.id, right)
            .await
            .unwrap();
        let done = server.quiz().complete_quiz(student_id, attempt.id).await.unwrap();
        let unlocked = done.topic_completion.unwrap();
        assert!(unlocked.section_completed);

        let done = server.progress().mark_topic_completed(student_id, pin).await.unwrap();
        assert!(done.course_newly_completed);

        let issue = server
            .certificates()
            .issue_certificate(enrollment.id)
            .await
            .unwrap();
        assert!(matches!(issue, CertificateIssue::Issued(_)));
        assert!(
            dir.path()
                .join(format!("{}.txt", issue.certificate().certificate_id))
                .exists()
        );
    }
}
