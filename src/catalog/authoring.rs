//! Course authoring: building the content hierarchy, either piece by piece or
//! from a TOML course definition.

use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use tracing::info;

use super::course::{ContentType, CourseLevel, CourseType};
use crate::error::{Error, Result};
use crate::utils::now;

#[derive(Debug, Clone, Deserialize)]
pub struct CourseDefinition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Category name, created on demand
    pub category: Option<String>,
    #[serde(default)]
    pub course_type: CourseType,
    #[serde(default)]
    pub course_level: CourseLevel,
    #[serde(default)]
    pub price: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    #[serde(default, rename = "section")]
    pub sections: Vec<SectionDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionDefinition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_required: bool,
    #[serde(default, rename = "topic")]
    pub topics: Vec<TopicDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicDefinition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub content_type: ContentType,
    pub video_path: Option<String>,
    pub article_content: Option<String>,
    pub quiz: Option<QuizDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuizDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_attempts")]
    pub attempts_allowed: i64,
    pub duration_minutes: Option<i64>,
    #[serde(default = "default_passing_score")]
    pub passing_score: i64,
    #[serde(default, rename = "question")]
    pub questions: Vec<QuestionDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionDefinition {
    #[serde(default)]
    pub name: String,
    pub text: String,
    #[serde(default = "default_mark")]
    pub mark: i64,
    #[serde(rename = "answer")]
    pub answers: Vec<AnswerDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerDefinition {
    pub text: String,
    #[serde(default)]
    pub correct: bool,
}

fn default_true() -> bool {
    true
}
fn default_attempts() -> i64 {
    1
}
fn default_passing_score() -> i64 {
    70
}
fn default_mark() -> i64 {
    1
}

impl CourseDefinition {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::InvalidContent(e.to_string()))
    }
}

/// Create a whole course tree in one transaction and return the course id.
pub async fn import_course(database: &SqlitePool, definition: &CourseDefinition) -> Result<i64> {
    let mut tx = database.begin().await?;
    let category_id = match &definition.category {
        Some(name) => Some(get_or_create_category(&mut tx, name).await?),
        None => None,
    };
    let course_id = create_course(&mut tx, definition, category_id).await?;
    for section in &definition.sections {
        let section_id = add_section(
            &mut tx,
            course_id,
            &section.title,
            &section.description,
            section.is_required,
        )
        .await?;
        for topic in &section.topics {
            let topic_id = add_topic(&mut tx, section_id, topic).await?;
            if let Some(quiz) = &topic.quiz {
                let quiz_id = attach_quiz(&mut tx, topic_id, quiz).await?;
                for question in &quiz.questions {
                    let question_id = add_question(&mut tx, question).await?;
                    link_question(&mut tx, quiz_id, question_id).await?;
                }
            }
        }
    }
    tx.commit().await?;
    info!("imported course {}-{}", course_id, definition.title);
    Ok(course_id)
}

pub async fn get_or_create_category(conn: &mut SqliteConnection, name: &str) -> Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO category (name) VALUES (?)")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    let id = sqlx::query_scalar("SELECT id FROM category WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}

/// Insert the course row only; sections in `definition` are ignored.
pub async fn create_course(
    conn: &mut SqliteConnection,
    definition: &CourseDefinition,
    category_id: Option<i64>,
) -> Result<i64> {
    if definition.price < 0 {
        return Err(Error::InvalidContent(format!(
            "negative price {}",
            definition.price
        )));
    }
    let id = sqlx::query(
        "INSERT INTO course (title, description, category_id, course_type, course_level, price, deadline, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&definition.title)
    .bind(&definition.description)
    .bind(category_id)
    .bind(definition.course_type)
    .bind(definition.course_level)
    .bind(definition.price)
    .bind(definition.deadline)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn add_section(
    conn: &mut SqliteConnection,
    course_id: i64,
    title: &str,
    description: &str,
    is_required: bool,
) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO section (course_id, title, description, is_required, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(course_id)
    .bind(title)
    .bind(description)
    .bind(is_required)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Insert the topic row only; a quiz in `definition` is ignored.
pub async fn add_topic(
    conn: &mut SqliteConnection,
    section_id: i64,
    definition: &TopicDefinition,
) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO topic (section_id, title, description, is_required, content_type, video_path, article_content, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(section_id)
    .bind(&definition.title)
    .bind(&definition.description)
    .bind(definition.is_required)
    .bind(definition.content_type)
    .bind(&definition.video_path)
    .bind(&definition.article_content)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Attach a quiz to a topic, turning it into a quiz topic. Questions in
/// `definition` are not inserted.
pub async fn attach_quiz(
    conn: &mut SqliteConnection,
    topic_id: i64,
    definition: &QuizDefinition,
) -> Result<i64> {
    if definition.attempts_allowed < 1 {
        return Err(Error::InvalidContent(format!(
            "quiz {} must allow at least one attempt",
            definition.name
        )));
    }
    if !(0..=100).contains(&definition.passing_score) {
        return Err(Error::InvalidContent(format!(
            "passing score {} is not a percentage",
            definition.passing_score
        )));
    }
    if definition.duration_minutes.is_some_and(|d| d <= 0) {
        return Err(Error::InvalidContent(format!(
            "quiz {} has a non-positive duration",
            definition.name
        )));
    }
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM quiz WHERE topic_id = ?")
        .bind(topic_id)
        .fetch_optional(&mut *conn)
        .await?;
    if existing.is_some() {
        return Err(Error::InvalidContent(format!(
            "topic {topic_id} already has a quiz"
        )));
    }
    let id = sqlx::query(
        "INSERT INTO quiz (topic_id, name, description, attempts_allowed, duration_minutes, passing_score, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(topic_id)
    .bind(&definition.name)
    .bind(&definition.description)
    .bind(definition.attempts_allowed)
    .bind(definition.duration_minutes)
    .bind(definition.passing_score)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    sqlx::query("UPDATE topic SET content_type = ? WHERE id = ?")
        .bind(ContentType::Quiz)
        .bind(topic_id)
        .execute(&mut *conn)
        .await?;
    Ok(id)
}

/// Insert a question with its answers. Exactly one answer must be correct.
pub async fn add_question(conn: &mut SqliteConnection, definition: &QuestionDefinition) -> Result<i64> {
    let correct = definition.answers.iter().filter(|a| a.correct).count();
    if correct != 1 {
        return Err(Error::InvalidContent(format!(
            "question '{}' has {} correct answers, expected exactly one",
            definition.text, correct
        )));
    }
    let id = sqlx::query("INSERT INTO question (name, text, mark, created_at) VALUES (?, ?, ?, ?)")
        .bind(&definition.name)
        .bind(&definition.text)
        .bind(definition.mark)
        .bind(now())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
    for answer in &definition.answers {
        sqlx::query("INSERT INTO answer (question_id, text, is_correct) VALUES (?, ?, ?)")
            .bind(id)
            .bind(&answer.text)
            .bind(answer.correct)
            .execute(&mut *conn)
            .await?;
    }
    Ok(id)
}

pub async fn link_question(conn: &mut SqliteConnection, quiz_id: i64, question_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO quiz_question (quiz_id, question_id) VALUES (?, ?)")
        .bind(quiz_id)
        .bind(question_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
