//! Progress state machine for one enrollment:
//! `CourseProgress → SectionProgress → TopicProgress`.
//!
//! Every mutation of an enrollment's progress runs under that enrollment's
//! lock and inside a single transaction, so a roll-up is either fully applied
//! or not at all. The final course-level write is guarded by the
//! `course_progress.version` counter.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::catalog::course::{
    Course, CourseType, Section, Topic, course_sections, first_topic, get_course, get_section,
    get_topic, next_section, next_topic, previous_topic, section_topics,
};
use crate::enrollment::{Enrollment, EnrollmentStatus, find_enrollment, get_enrollment};
use crate::error::{Error, Result};
use crate::utils::{clamp_percentage, now};

/// Highest percentage an unfinished course can show.
const MAX_INCOMPLETE_PERCENTAGE: f64 = 99.99;
/// Attempts at a roll-up that keeps losing the version check.
const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CourseProgress {
    pub id: i64,
    pub enrollment_id: i64,
    pub progress_percentage: f64,
    pub completed: bool,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SectionProgress {
    pub id: i64,
    pub course_progress_id: i64,
    pub section_id: i64,
    pub completed: bool,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TopicProgress {
    pub id: i64,
    pub section_progress_id: i64,
    pub topic_id: i64,
    pub completed: bool,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
}

/// What unlocked after a topic was completed in a sequential course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Activation {
    Topic { topic_id: i64 },
    Section { section_id: i64, topic_id: Option<i64> },
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicCompletion {
    pub topic_id: i64,
    /// The topic was not completed before this call
    pub newly_completed: bool,
    pub section_completed: bool,
    pub course_completed: bool,
    /// This call stamped `Enrollment.completed_at`
    pub course_newly_completed: bool,
    pub progress_percentage: f64,
    pub activated: Option<Activation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicAccess {
    pub topic: Topic,
    pub progress: TopicProgress,
    pub previous: Option<Topic>,
    /// Crosses into the following section at the end of this one
    pub next: Option<Topic>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicState {
    pub topic: Topic,
    pub progress: TopicProgress,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionState {
    pub section: Section,
    pub progress: SectionProgress,
    pub topics: Vec<TopicState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseOverview {
    pub course: Course,
    pub enrollment: Enrollment,
    pub progress: CourseProgress,
    pub sections: Vec<SectionState>,
    /// Where the student should continue studying
    pub resume_topic_id: Option<i64>,
}

/// Required/total counters for one level of the hierarchy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct CompletionCounts {
    pub required_total: i64,
    pub required_done: i64,
    pub total: i64,
    pub done: i64,
}

impl CompletionCounts {
    /// Required items decide completion when there are any, otherwise all items do.
    pub fn is_complete(&self) -> bool {
        if self.required_total > 0 {
            self.required_done >= self.required_total
        } else {
            self.done >= self.total
        }
    }

    pub fn percentage(&self) -> f64 {
        let (done, total) = if self.required_total > 0 {
            (self.required_done, self.required_total)
        } else {
            (self.done, self.total)
        };
        if total == 0 {
            return 0.0;
        }
        clamp_percentage(done as f64 / total as f64 * 100.0)
    }
}

/// Which items start unlocked when progress is created.
/// Returns `(section_active, topic_active)`.
pub fn initial_activation(course_type: CourseType, section_index: usize, topic_index: usize) -> (bool, bool) {
    if !course_type.is_sequential() {
        return (true, true);
    }
    let section_active = section_index == 0;
    (section_active, section_active && topic_index == 0)
}

/// Per-enrollment async locks serializing progress mutations.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentLocks(Arc<DashMap<i64, Arc<Mutex<()>>>>);

impl EnrollmentLocks {
    pub async fn lock(&self, enrollment_id: i64) -> EnrollmentGuard {
        let lock = self.0.entry(enrollment_id).or_default().value().clone();
        EnrollmentGuard {
            guard: Some(lock.lock_owned().await),
            locks: self.0.clone(),
            enrollment_id,
        }
    }

    /// Number of enrollments that currently have a lock entry.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Held lock of one enrollment. The registry entry is dropped together with
/// the last guard nobody else is waiting behind.
pub struct EnrollmentGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
    enrollment_id: i64,
}

impl Drop for EnrollmentGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // waiters hold their own clone, so only the map's reference is left when idle
        self.locks
            .remove_if(&self.enrollment_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEngine {
    database: SqlitePool,
    locks: EnrollmentLocks,
}

/// Catalog rows a topic operation works on, resolved before taking the lock.
struct TopicTarget {
    topic: Topic,
    section: Section,
    course: Course,
    enrollment_id: i64,
}

impl ProgressEngine {
    pub fn new(database: SqlitePool) -> Self {
        Self {
            database,
            locks: EnrollmentLocks::default(),
        }
    }

    pub fn database(&self) -> &SqlitePool {
        &self.database
    }

    pub(crate) fn locks(&self) -> &EnrollmentLocks {
        &self.locks
    }

    /// Create the progress hierarchy of an enrollment. Rows that already
    /// exist are left untouched, so calling this again is a no-op.
    pub async fn initialize_progress(&self, enrollment_id: i64) -> Result<CourseProgress> {
        let _guard = self.locks.lock(enrollment_id).await;
        self.initialize_unlocked(enrollment_id).await
    }

    async fn initialize_unlocked(&self, enrollment_id: i64) -> Result<CourseProgress> {
        let mut tx = self.database.begin().await?;
        let enrollment = get_enrollment(&mut tx, enrollment_id).await?;
        let progress = initialize_in(&mut tx, &enrollment).await?;
        tx.commit().await?;
        Ok(progress)
    }

    async fn resolve(&self, student_id: i64, topic_id: i64) -> Result<TopicTarget> {
        let mut conn = self.database.acquire().await?;
        let topic = get_topic(&mut conn, topic_id).await?;
        let section = get_section(&mut conn, topic.section_id).await?;
        let course = get_course(&mut conn, section.course_id).await?;
        let enrollment = find_enrollment(&mut conn, student_id, course.id)
            .await?
            .ok_or(Error::NotEnrolled {
                student_id,
                course_id: course.id,
            })?;
        Ok(TopicTarget {
            topic,
            section,
            course,
            enrollment_id: enrollment.id,
        })
    }

    /// Mark a topic completed for a student and roll the result up to the
    /// section and the course.
    pub async fn mark_topic_completed(&self, student_id: i64, topic_id: i64) -> Result<TopicCompletion> {
        let target = self.resolve(student_id, topic_id).await?;
        let _guard = self.locks.lock(target.enrollment_id).await;
        let mut reinitialized = false;
        let mut conflicts = 0;
        loop {
            match self.try_mark_completed(&target).await {
                Err(Error::ProgressNotInitialized(id)) if !reinitialized => {
                    warn!("progress missing for enrollment {}, initializing", id);
                    self.initialize_unlocked(id).await?;
                    reinitialized = true;
                }
                Err(Error::ProgressNotInitialized(id)) => {
                    error!("progress still missing for enrollment {} after initialization", id);
                    return Err(Error::Fatal(anyhow::anyhow!(
                        "progress records for enrollment {id} are missing after initialization"
                    )));
                }
                Err(Error::Conflict(id)) if conflicts < MAX_CONFLICT_RETRIES => {
                    warn!("version conflict on course progress {}, retrying", id);
                    conflicts += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_mark_completed(&self, target: &TopicTarget) -> Result<TopicCompletion> {
        let TopicTarget {
            topic,
            section,
            course,
            enrollment_id,
        } = target;
        let mut tx = self.database.begin().await?;
        let enrollment = get_enrollment(&mut tx, *enrollment_id).await?;
        if enrollment.status == EnrollmentStatus::Paused {
            return Err(Error::EnrollmentPaused(enrollment.id));
        }
        let course_progress = load_course_progress(&mut tx, enrollment.id)
            .await?
            .ok_or(Error::ProgressNotInitialized(enrollment.id))?;
        let section_progress = load_section_progress(&mut tx, course_progress.id, section.id)
            .await?
            .ok_or(Error::ProgressNotInitialized(enrollment.id))?;
        let topic_progress = load_topic_progress(&mut tx, section_progress.id, topic.id)
            .await?
            .ok_or(Error::ProgressNotInitialized(enrollment.id))?;
        if course.course_type.is_sequential()
            && !topic_progress.is_active
            && enrollment.completed_at.is_none()
        {
            return Err(Error::TopicLocked(topic.id));
        }

        let now = now();
        let newly_completed = !topic_progress.completed;
        sqlx::query("UPDATE topic_progress SET completed = 1, last_accessed = ? WHERE id = ?")
            .bind(now)
            .bind(topic_progress.id)
            .execute(&mut *tx)
            .await?;

        // Every section is recomputed, not only this one, so a section that
        // finished out of order still counts towards the course.
        let mut section_completed = false;
        for other in course_sections(&mut tx, course.id).await? {
            let progress = load_section_progress(&mut tx, course_progress.id, other.id)
                .await?
                .ok_or(Error::ProgressNotInitialized(enrollment.id))?;
            let complete = section_counts(&mut tx, progress.id, other.id)
                .await?
                .is_complete();
            if complete != progress.completed {
                sqlx::query("UPDATE section_progress SET completed = ? WHERE id = ?")
                    .bind(complete)
                    .bind(progress.id)
                    .execute(&mut *tx)
                    .await?;
            }
            if other.id == section.id {
                section_completed = complete;
            }
        }

        let sections = course_counts(&mut tx, course_progress.id, course.id).await?;
        let course_completed = enrollment.completed_at.is_some()
            || (sections.total > 0 && sections.is_complete());
        let mut course_newly_completed = false;
        let progress_percentage = if course_completed {
            write_course_progress(&mut tx, &course_progress, 100.0, true).await?;
            course_newly_completed = stamp_completed(&mut tx, enrollment.id, now).await?;
            100.0
        } else {
            let topics = course_topic_counts(&mut tx, course_progress.id, course.id).await?;
            let percentage = topics.percentage().min(MAX_INCOMPLETE_PERCENTAGE);
            write_course_progress(&mut tx, &course_progress, percentage, false).await?;
            percentage
        };

        let activated = if course.course_type.is_sequential() && !course_completed {
            activate_next(&mut tx, course_progress.id, section, &section_progress, topic, section_completed)
                .await?
        } else {
            None
        };
        tx.commit().await?;

        if newly_completed {
            info!(
                "enrollment {} completed topic {}-{}",
                enrollment.id, topic.id, topic.title
            );
        }
        if course_newly_completed {
            info!(
                "enrollment {} completed course {}-{}",
                enrollment.id, course.id, course.title
            );
        }
        Ok(TopicCompletion {
            topic_id: topic.id,
            newly_completed,
            section_completed,
            course_completed,
            course_newly_completed,
            progress_percentage,
            activated,
        })
    }

    /// Open a topic for study: checks access and refreshes `last_accessed`.
    pub async fn open_topic(&self, student_id: i64, topic_id: i64) -> Result<TopicAccess> {
        let target = self.resolve(student_id, topic_id).await?;
        match self.try_open(&target).await {
            Err(Error::ProgressNotInitialized(id)) => {
                warn!("progress missing for enrollment {}, initializing", id);
                self.initialize_progress(id).await?;
                self.try_open(&target).await
            }
            result => result,
        }
    }

    async fn try_open(&self, target: &TopicTarget) -> Result<TopicAccess> {
        let mut tx = self.database.begin().await?;
        let enrollment = get_enrollment(&mut tx, target.enrollment_id).await?;
        if enrollment.status == EnrollmentStatus::Paused {
            return Err(Error::EnrollmentPaused(enrollment.id));
        }
        let missing = Error::ProgressNotInitialized(enrollment.id);
        let course_progress = load_course_progress(&mut tx, enrollment.id)
            .await?
            .ok_or(missing)?;
        let section_progress = load_section_progress(&mut tx, course_progress.id, target.section.id)
            .await?
            .ok_or(Error::ProgressNotInitialized(enrollment.id))?;
        let mut progress = load_topic_progress(&mut tx, section_progress.id, target.topic.id)
            .await?
            .ok_or(Error::ProgressNotInitialized(enrollment.id))?;
        if target.course.course_type.is_sequential()
            && !progress.is_active
            && enrollment.completed_at.is_none()
        {
            return Err(Error::TopicLocked(target.topic.id));
        }
        progress.last_accessed = now();
        sqlx::query("UPDATE topic_progress SET last_accessed = ? WHERE id = ?")
            .bind(progress.last_accessed)
            .bind(progress.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE section_progress SET last_accessed = ? WHERE id = ?")
            .bind(progress.last_accessed)
            .bind(section_progress.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE course_progress SET last_accessed = ? WHERE id = ?")
            .bind(progress.last_accessed)
            .bind(course_progress.id)
            .execute(&mut *tx)
            .await?;

        let previous = previous_topic(&mut tx, &target.topic).await?;
        let next = match next_topic(&mut tx, &target.topic).await? {
            Some(next) => Some(next),
            None => match next_section(&mut tx, &target.section).await? {
                Some(section) => first_topic(&mut tx, section.id).await?,
                None => None,
            },
        };
        tx.commit().await?;
        Ok(TopicAccess {
            topic: target.topic.clone(),
            progress,
            previous,
            next,
        })
    }

    /// Everything a study page needs about one enrollment.
    pub async fn course_overview(&self, student_id: i64, course_id: i64) -> Result<CourseOverview> {
        let enrollment = {
            let mut conn = self.database.acquire().await?;
            find_enrollment(&mut conn, student_id, course_id)
                .await?
                .ok_or(Error::NotEnrolled {
                    student_id,
                    course_id,
                })?
        };
        match self.try_overview(&enrollment).await {
            Err(Error::ProgressNotInitialized(id)) => {
                warn!("progress missing for enrollment {}, initializing", id);
                self.initialize_progress(id).await?;
                self.try_overview(&enrollment).await
            }
            result => result,
        }
    }

    async fn try_overview(&self, enrollment: &Enrollment) -> Result<CourseOverview> {
        let mut conn = self.database.acquire().await?;
        let course = get_course(&mut conn, enrollment.course_id).await?;
        let enrollment = get_enrollment(&mut conn, enrollment.id).await?;
        let progress = load_course_progress(&mut conn, enrollment.id)
            .await?
            .ok_or(Error::ProgressNotInitialized(enrollment.id))?;
        let mut sections = Vec::new();
        let mut resume_topic_id = None;
        let mut first_active = None;
        for section in course_sections(&mut conn, course.id).await? {
            let section_progress = load_section_progress(&mut conn, progress.id, section.id)
                .await?
                .ok_or(Error::ProgressNotInitialized(enrollment.id))?;
            let mut topics = Vec::new();
            for topic in section_topics(&mut conn, section.id).await? {
                let topic_progress = load_topic_progress(&mut conn, section_progress.id, topic.id)
                    .await?
                    .ok_or(Error::ProgressNotInitialized(enrollment.id))?;
                if topic_progress.is_active {
                    first_active.get_or_insert(topic.id);
                    if !topic_progress.completed && resume_topic_id.is_none() {
                        resume_topic_id = Some(topic.id);
                    }
                }
                topics.push(TopicState {
                    topic,
                    progress: topic_progress,
                });
            }
            sections.push(SectionState {
                section,
                progress: section_progress,
                topics,
            });
        }
        Ok(CourseOverview {
            course,
            enrollment,
            progress,
            sections,
            resume_topic_id: resume_topic_id.or(first_active),
        })
    }
}

/// Create missing progress rows for an enrollment inside the caller's
/// transaction and return its course progress.
pub(crate) async fn initialize_in(conn: &mut SqliteConnection, enrollment: &Enrollment) -> Result<CourseProgress> {
    let course = get_course(conn, enrollment.course_id).await?;
    let now = now();
    sqlx::query(
        "INSERT OR IGNORE INTO course_progress (enrollment_id, progress_percentage, completed, version, last_accessed) \
         VALUES (?, 0, 0, 0, ?)",
    )
    .bind(enrollment.id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    let course_progress = load_course_progress(conn, enrollment.id)
        .await?
        .ok_or(Error::ProgressNotInitialized(enrollment.id))?;

    for (section_index, section) in course_sections(conn, course.id).await?.iter().enumerate() {
        let (section_active, _) = initial_activation(course.course_type, section_index, 0);
        sqlx::query(
            "INSERT OR IGNORE INTO section_progress (course_progress_id, section_id, completed, is_active, last_accessed) \
             VALUES (?, ?, 0, ?, ?)",
        )
        .bind(course_progress.id)
        .bind(section.id)
        .bind(section_active)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        let section_progress_id: i64 = sqlx::query_scalar(
            "SELECT id FROM section_progress WHERE course_progress_id = ? AND section_id = ?",
        )
        .bind(course_progress.id)
        .bind(section.id)
        .fetch_one(&mut *conn)
        .await?;
        for (topic_index, topic) in section_topics(conn, section.id).await?.iter().enumerate() {
            let (_, topic_active) = initial_activation(course.course_type, section_index, topic_index);
            sqlx::query(
                "INSERT OR IGNORE INTO topic_progress (section_progress_id, topic_id, completed, is_active, last_accessed) \
                 VALUES (?, ?, 0, ?, ?)",
            )
            .bind(section_progress_id)
            .bind(topic.id)
            .bind(topic_active)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(course_progress)
}

pub(crate) async fn load_course_progress(
    conn: &mut SqliteConnection,
    enrollment_id: i64,
) -> Result<Option<CourseProgress>> {
    let progress = sqlx::query_as::<_, CourseProgress>(
        "SELECT id, enrollment_id, progress_percentage, completed, version, last_accessed \
         FROM course_progress WHERE enrollment_id = ?",
    )
    .bind(enrollment_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(progress)
}

pub(crate) async fn load_section_progress(
    conn: &mut SqliteConnection,
    course_progress_id: i64,
    section_id: i64,
) -> Result<Option<SectionProgress>> {
    let progress = sqlx::query_as::<_, SectionProgress>(
        "SELECT id, course_progress_id, section_id, completed, is_active, last_accessed \
         FROM section_progress WHERE course_progress_id = ? AND section_id = ?",
    )
    .bind(course_progress_id)
    .bind(section_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(progress)
}

pub(crate) async fn load_topic_progress(
    conn: &mut SqliteConnection,
    section_progress_id: i64,
    topic_id: i64,
) -> Result<Option<TopicProgress>> {
    let progress = sqlx::query_as::<_, TopicProgress>(
        "SELECT id, section_progress_id, topic_id, completed, is_active, last_accessed \
         FROM topic_progress WHERE section_progress_id = ? AND topic_id = ?",
    )
    .bind(section_progress_id)
    .bind(topic_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(progress)
}

/// Topic-level counters of one section.
async fn section_counts(
    conn: &mut SqliteConnection,
    section_progress_id: i64,
    section_id: i64,
) -> Result<CompletionCounts> {
    let counts = sqlx::query_as::<_, CompletionCounts>(
        "SELECT COALESCE(SUM(topic.is_required), 0) AS required_total, \
                COALESCE(SUM(CASE WHEN topic.is_required AND topic_progress.completed THEN 1 ELSE 0 END), 0) AS required_done, \
                COUNT(topic.id) AS total, \
                COALESCE(SUM(CASE WHEN topic_progress.completed THEN 1 ELSE 0 END), 0) AS done \
         FROM topic LEFT JOIN topic_progress \
              ON topic_progress.topic_id = topic.id AND topic_progress.section_progress_id = ? \
         WHERE topic.section_id = ?",
    )
    .bind(section_progress_id)
    .bind(section_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(counts)
}

/// Section-level counters of one course.
pub(crate) async fn course_counts(
    conn: &mut SqliteConnection,
    course_progress_id: i64,
    course_id: i64,
) -> Result<CompletionCounts> {
    let counts = sqlx::query_as::<_, CompletionCounts>(
        "SELECT COALESCE(SUM(section.is_required), 0) AS required_total, \
                COALESCE(SUM(CASE WHEN section.is_required AND section_progress.completed THEN 1 ELSE 0 END), 0) AS required_done, \
                COUNT(section.id) AS total, \
                COALESCE(SUM(CASE WHEN section_progress.completed THEN 1 ELSE 0 END), 0) AS done \
         FROM section LEFT JOIN section_progress \
              ON section_progress.section_id = section.id AND section_progress.course_progress_id = ? \
         WHERE section.course_id = ?",
    )
    .bind(course_progress_id)
    .bind(course_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(counts)
}

/// Topic-level counters across a whole course, used for the percentage.
pub(crate) async fn course_topic_counts(
    conn: &mut SqliteConnection,
    course_progress_id: i64,
    course_id: i64,
) -> Result<CompletionCounts> {
    let counts = sqlx::query_as::<_, CompletionCounts>(
        "SELECT COALESCE(SUM(topic.is_required), 0) AS required_total, \
                COALESCE(SUM(CASE WHEN topic.is_required AND topic_progress.completed THEN 1 ELSE 0 END), 0) AS required_done, \
                COUNT(topic.id) AS total, \
                COALESCE(SUM(CASE WHEN topic_progress.completed THEN 1 ELSE 0 END), 0) AS done \
         FROM topic \
         INNER JOIN section ON section.id = topic.section_id \
         LEFT JOIN section_progress \
              ON section_progress.section_id = section.id AND section_progress.course_progress_id = ? \
         LEFT JOIN topic_progress \
              ON topic_progress.topic_id = topic.id AND topic_progress.section_progress_id = section_progress.id \
         WHERE section.course_id = ?",
    )
    .bind(course_progress_id)
    .bind(course_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(counts)
}

/// Compare-and-set on `version`; a lost race surfaces as [`Error::Conflict`].
pub(crate) async fn write_course_progress(
    conn: &mut SqliteConnection,
    progress: &CourseProgress,
    percentage: f64,
    completed: bool,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE course_progress SET progress_percentage = ?, completed = ?, version = version + 1, last_accessed = ? \
         WHERE id = ? AND version = ?",
    )
    .bind(percentage)
    .bind(completed)
    .bind(now())
    .bind(progress.id)
    .bind(progress.version)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(Error::Conflict(progress.id));
    }
    Ok(())
}

/// Set `completed_at` unless it is already set. Returns whether this call set it.
pub(crate) async fn stamp_completed(
    conn: &mut SqliteConnection,
    enrollment_id: i64,
    at: OffsetDateTime,
) -> Result<bool> {
    let result =
        sqlx::query("UPDATE enrollment SET completed_at = ? WHERE id = ? AND completed_at IS NULL")
            .bind(at)
            .bind(enrollment_id)
            .execute(&mut *conn)
            .await?;
    Ok(result.rows_affected() == 1)
}

async fn activate_section(conn: &mut SqliteConnection, course_progress_id: i64, section_id: i64) -> Result<i64> {
    sqlx::query(
        "INSERT INTO section_progress (course_progress_id, section_id, completed, is_active, last_accessed) \
         VALUES (?, ?, 0, 1, ?) ON CONFLICT (course_progress_id, section_id) DO UPDATE SET is_active = 1",
    )
    .bind(course_progress_id)
    .bind(section_id)
    .bind(now())
    .execute(&mut *conn)
    .await?;
    let id = sqlx::query_scalar(
        "SELECT id FROM section_progress WHERE course_progress_id = ? AND section_id = ?",
    )
    .bind(course_progress_id)
    .bind(section_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn activate_topic(conn: &mut SqliteConnection, section_progress_id: i64, topic_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO topic_progress (section_progress_id, topic_id, completed, is_active, last_accessed) \
         VALUES (?, ?, 0, 1, ?) ON CONFLICT (section_progress_id, topic_id) DO UPDATE SET is_active = 1",
    )
    .bind(section_progress_id)
    .bind(topic_id)
    .bind(now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Unlock whatever follows `topic` in a sequential course. Sections without
/// topics are unlocked and skipped over.
async fn activate_next(
    conn: &mut SqliteConnection,
    course_progress_id: i64,
    section: &Section,
    section_progress: &SectionProgress,
    topic: &Topic,
    section_completed: bool,
) -> Result<Option<Activation>> {
    if !section_completed {
        return match next_topic(conn, topic).await? {
            Some(next) => {
                activate_topic(conn, section_progress.id, next.id).await?;
                Ok(Some(Activation::Topic { topic_id: next.id }))
            }
            None => Ok(None),
        };
    }
    let mut current = section.clone();
    let mut activated = None;
    while let Some(next) = next_section(conn, &current).await? {
        let next_progress_id = activate_section(conn, course_progress_id, next.id).await?;
        let first = first_topic(conn, next.id).await?;
        if let Some(first) = &first {
            activate_topic(conn, next_progress_id, first.id).await?;
        }
        activated = Some(Activation::Section {
            section_id: next.id,
            topic_id: first.as_ref().map(|t| t.id),
        });
        if first.is_some() {
            break;
        }
        current = next;
    }
    Ok(activated)
}
