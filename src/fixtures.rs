//! Shared builders for the unit tests.

use sqlx::SqlitePool;

use crate::catalog::authoring::{CourseDefinition, import_course};
use crate::catalog::course::{course_sections, section_topics};
use crate::db::connect_memory;
use crate::enrollment::{EnrollOutcome, Enrollment, enroll_free};
use crate::progress::ProgressEngine;
use crate::student::create_student;

pub struct CourseTree {
    pub course_id: i64,
    pub sections: Vec<i64>,
    /// Topic ids per section, in creation order
    pub topics: Vec<Vec<i64>>,
}

pub async fn setup() -> (SqlitePool, ProgressEngine) {
    let database = connect_memory().await.unwrap();
    let progress = ProgressEngine::new(database.clone());
    (database, progress)
}

pub async fn import(database: &SqlitePool, toml: &str) -> CourseTree {
    let definition = CourseDefinition::from_toml(toml).unwrap();
    let course_id = import_course(database, &definition).await.unwrap();
    let mut conn = database.acquire().await.unwrap();
    let mut sections = Vec::new();
    let mut topics = Vec::new();
    for section in course_sections(&mut conn, course_id).await.unwrap() {
        sections.push(section.id);
        topics.push(
            section_topics(&mut conn, section.id)
                .await
                .unwrap()
                .into_iter()
                .map(|t| t.id)
                .collect(),
        );
    }
    CourseTree {
        course_id,
        sections,
        topics,
    }
}

/// S1(T1, T2), S2(T3, T4); nothing marked required at topic level.
pub fn two_by_two(course_type: &str) -> String {
    format!(
        r#"
title = "Two by two"
course_type = "{course_type}"

[[section]]
title = "S1"
[[section.topic]]
title = "T1"
[[section.topic]]
title = "T2"

[[section]]
title = "S2"
[[section.topic]]
title = "T3"
[[section.topic]]
title = "T4"
"#
    )
}

pub async fn student(database: &SqlitePool, name: &str) -> i64 {
    create_student(database, name, &format!("{name}@example.com"))
        .await
        .unwrap()
}

pub async fn enroll(progress: &ProgressEngine, student_id: i64, course_id: i64) -> Enrollment {
    match enroll_free(progress, student_id, course_id).await.unwrap() {
        EnrollOutcome::Enrolled(e) | EnrollOutcome::AlreadyEnrolled(e) => e,
    }
}
