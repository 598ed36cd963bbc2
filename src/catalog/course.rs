use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use time::OffsetDateTime;

use super::quiz::{Quiz, get_topic_quiz};
use crate::error::{Error, Result};

/// How the content of a course is unlocked for its students.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CourseType {
    /// Sections and topics unlock strictly in creation order.
    #[default]
    Locked,
    /// Instructor-paced; unlocks like `Locked`.
    Managed,
    /// Everything is available right after enrollment.
    Unlocked,
}

impl CourseType {
    /// Whether content unlocks one item at a time in creation order.
    pub fn is_sequential(self) -> bool {
        !matches!(self, CourseType::Unlocked)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CourseLevel {
    Beginner,
    Intermediate,
    Advanced,
    #[default]
    General,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Video,
    Article,
    Quiz,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub category_id: Option<i64>,
    pub course_type: CourseType,
    pub course_level: CourseLevel,
    /// In the smallest currency unit; 0 means free
    pub price: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Course {
    pub fn is_free(&self) -> bool {
        self.price == 0
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Section {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
    pub description: String,
    pub is_required: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Topic {
    pub id: i64,
    pub section_id: i64,
    pub title: String,
    pub description: String,
    pub is_required: bool,
    pub content_type: ContentType,
    pub video_path: Option<String>,
    pub article_content: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Present only for quiz topics
    #[sqlx(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiz: Option<Quiz>,
}

const COURSE_COLUMNS: &str = "id, title, description, category_id, course_type, course_level, price, deadline, created_at";
const SECTION_COLUMNS: &str = "id, course_id, title, description, is_required, created_at";
const TOPIC_COLUMNS: &str =
    "id, section_id, title, description, is_required, content_type, video_path, article_content, created_at";

pub async fn get_course(conn: &mut SqliteConnection, course_id: i64) -> Result<Course> {
    sqlx::query_as::<_, Course>(&format!("SELECT {COURSE_COLUMNS} FROM course WHERE id = ?"))
        .bind(course_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("course", course_id))
}

pub async fn get_section(conn: &mut SqliteConnection, section_id: i64) -> Result<Section> {
    sqlx::query_as::<_, Section>(&format!("SELECT {SECTION_COLUMNS} FROM section WHERE id = ?"))
        .bind(section_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found("section", section_id))
}

/// Load a topic together with its quiz, if it has one.
pub async fn get_topic(conn: &mut SqliteConnection, topic_id: i64) -> Result<Topic> {
    let mut topic =
        sqlx::query_as::<_, Topic>(&format!("SELECT {TOPIC_COLUMNS} FROM topic WHERE id = ?"))
            .bind(topic_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| Error::not_found("topic", topic_id))?;
    topic.quiz = get_topic_quiz(conn, topic_id).await?;
    Ok(topic)
}

/// Sections of a course in creation order.
pub async fn course_sections(conn: &mut SqliteConnection, course_id: i64) -> Result<Vec<Section>> {
    let sections = sqlx::query_as::<_, Section>(&format!(
        "SELECT {SECTION_COLUMNS} FROM section WHERE course_id = ? ORDER BY created_at, id"
    ))
    .bind(course_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(sections)
}

/// Topics of a section in creation order, without their quizzes.
pub async fn section_topics(conn: &mut SqliteConnection, section_id: i64) -> Result<Vec<Topic>> {
    let topics = sqlx::query_as::<_, Topic>(&format!(
        "SELECT {TOPIC_COLUMNS} FROM topic WHERE section_id = ? ORDER BY created_at, id"
    ))
    .bind(section_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(topics)
}

/// The section following `section` in its course, by creation order.
pub async fn next_section(conn: &mut SqliteConnection, section: &Section) -> Result<Option<Section>> {
    let next = sqlx::query_as::<_, Section>(&format!(
        "SELECT {SECTION_COLUMNS} FROM section WHERE course_id = ? AND (created_at > ? OR (created_at = ? AND id > ?)) \
         ORDER BY created_at, id LIMIT 1"
    ))
    .bind(section.course_id)
    .bind(section.created_at)
    .bind(section.created_at)
    .bind(section.id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(next)
}

/// The topic following `topic` in its section, by creation order.
pub async fn next_topic(conn: &mut SqliteConnection, topic: &Topic) -> Result<Option<Topic>> {
    let next = sqlx::query_as::<_, Topic>(&format!(
        "SELECT {TOPIC_COLUMNS} FROM topic WHERE section_id = ? AND (created_at > ? OR (created_at = ? AND id > ?)) \
         ORDER BY created_at, id LIMIT 1"
    ))
    .bind(topic.section_id)
    .bind(topic.created_at)
    .bind(topic.created_at)
    .bind(topic.id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(next)
}

/// The topic preceding `topic` in its section, by creation order.
pub async fn previous_topic(conn: &mut SqliteConnection, topic: &Topic) -> Result<Option<Topic>> {
    let previous = sqlx::query_as::<_, Topic>(&format!(
        "SELECT {TOPIC_COLUMNS} FROM topic WHERE section_id = ? AND (created_at < ? OR (created_at = ? AND id < ?)) \
         ORDER BY created_at DESC, id DESC LIMIT 1"
    ))
    .bind(topic.section_id)
    .bind(topic.created_at)
    .bind(topic.created_at)
    .bind(topic.id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(previous)
}

pub async fn first_topic(conn: &mut SqliteConnection, section_id: i64) -> Result<Option<Topic>> {
    let first = sqlx::query_as::<_, Topic>(&format!(
        "SELECT {TOPIC_COLUMNS} FROM topic WHERE section_id = ? ORDER BY created_at, id LIMIT 1"
    ))
    .bind(section_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(first)
}
