use serde::Serialize;
use sqlx::SqliteConnection;
use time::OffsetDateTime;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Quiz {
    pub id: i64,
    pub topic_id: i64,
    pub name: String,
    pub description: String,
    pub attempts_allowed: i64,
    /// `None` means no time limit
    pub duration_minutes: Option<i64>,
    /// Percentage needed to pass
    pub passing_score: i64,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Quiz {
    pub fn time_limit(&self) -> Option<time::Duration> {
        self.duration_minutes.map(time::Duration::minutes)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Question {
    pub id: i64,
    pub name: String,
    pub text: String,
    /// Points for this question
    pub mark: i64,
    #[sqlx(skip)]
    pub answers: Vec<Answer>,
}

impl Question {
    pub fn correct_answer(&self) -> Option<&Answer> {
        self.answers.iter().find(|a| a.is_correct)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Answer {
    pub id: i64,
    pub question_id: i64,
    pub text: String,
    pub is_correct: bool,
}

const QUIZ_COLUMNS: &str = "id, topic_id, name, description, attempts_allowed, duration_minutes, passing_score, is_active, created_at";

pub async fn get_quiz(conn: &mut SqliteConnection, quiz_id: i64) -> Result<Quiz> {
    sqlx::query_as::<_, Quiz>(&format!("SELECT {QUIZ_COLUMNS} FROM quiz WHERE id = ?"))
        .bind(quiz_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("quiz", quiz_id))
}

pub async fn get_topic_quiz(conn: &mut SqliteConnection, topic_id: i64) -> Result<Option<Quiz>> {
    let quiz = sqlx::query_as::<_, Quiz>(&format!("SELECT {QUIZ_COLUMNS} FROM quiz WHERE topic_id = ?"))
        .bind(topic_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(quiz)
}

/// Questions of a quiz with their answers, in a stable order.
pub async fn quiz_questions(conn: &mut SqliteConnection, quiz_id: i64) -> Result<Vec<Question>> {
    let mut questions = sqlx::query_as::<_, Question>(
        "SELECT question.id, question.name, question.text, question.mark FROM question \
         INNER JOIN quiz_question ON quiz_question.question_id = question.id \
         WHERE quiz_question.quiz_id = ? ORDER BY question.id",
    )
    .bind(quiz_id)
    .fetch_all(&mut *conn)
    .await?;
    for question in questions.iter_mut() {
        question.answers = question_answers(conn, question.id).await?;
    }
    Ok(questions)
}

pub async fn question_answers(conn: &mut SqliteConnection, question_id: i64) -> Result<Vec<Answer>> {
    let answers = sqlx::query_as::<_, Answer>(
        "SELECT id, question_id, text, is_correct FROM answer WHERE question_id = ? ORDER BY id",
    )
    .bind(question_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(answers)
}

pub async fn question_count(conn: &mut SqliteConnection, quiz_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quiz_question WHERE quiz_id = ?")
        .bind(quiz_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Sum of the marks of every question in the quiz.
pub async fn total_marks(conn: &mut SqliteConnection, quiz_id: i64) -> Result<i64> {
    let marks: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(question.mark), 0) FROM question \
         INNER JOIN quiz_question ON quiz_question.question_id = question.id WHERE quiz_question.quiz_id = ?",
    )
    .bind(quiz_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(marks)
}
