use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use time::OffsetDateTime;
use tracing::info;

use super::course::{
    Category, Course, CourseLevel, CourseType, Section, Topic, course_sections, get_course,
    section_topics,
};
use crate::enrollment::find_enrollment;
use crate::error::{Error, Result};
use crate::utils::now;

pub const PAGE_SIZE: i64 = 12;
const RELATED_COURSES: i64 = 4;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseFilter {
    /// Matched against title and description
    pub search: Option<String>,
    pub category_id: Option<i64>,
    pub course_type: Option<CourseType>,
    pub course_level: Option<CourseLevel>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    /// 1-based, clamped into the available pages
    pub page: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoursePage {
    pub courses: Vec<Course>,
    pub page: i64,
    pub total_pages: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionOutline {
    pub section: Section,
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseDetail {
    pub course: Course,
    pub sections: Vec<SectionOutline>,
    pub average_rating: Option<f64>,
    /// Index 0 holds the number of 1-star reviews
    pub star_counts: [i64; 5],
    pub reviews: Vec<Review>,
    pub related: Vec<Course>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Review {
    pub id: i64,
    pub course_id: i64,
    pub student_id: i64,
    pub rating: i64,
    pub comment: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub enum ReviewOutcome {
    Created(Review),
    Updated(Review),
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &CourseFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(search) = filter.search.as_ref().filter(|s| !s.trim().is_empty()) {
        let pattern = format!("%{}%", search.trim());
        builder
            .push(" AND (title LIKE ")
            .push_bind(pattern.clone())
            .push(" OR description LIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(category_id) = filter.category_id {
        builder.push(" AND category_id = ").push_bind(category_id);
    }
    if let Some(course_type) = filter.course_type {
        builder.push(" AND course_type = ").push_bind(course_type);
    }
    if let Some(course_level) = filter.course_level {
        builder.push(" AND course_level = ").push_bind(course_level);
    }
    if let Some(min_price) = filter.min_price {
        builder.push(" AND price >= ").push_bind(min_price);
    }
    if let Some(max_price) = filter.max_price {
        builder.push(" AND price <= ").push_bind(max_price);
    }
}

/// Newest courses first, [`PAGE_SIZE`] per page.
pub async fn list_courses(database: &SqlitePool, filter: &CourseFilter) -> Result<CoursePage> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM course");
    push_filters(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(database).await?;

    let total_pages = ((total + PAGE_SIZE - 1) / PAGE_SIZE).max(1);
    let page = filter.page.unwrap_or(1).clamp(1, total_pages);

    let mut select = QueryBuilder::<Sqlite>::new(
        "SELECT id, title, description, category_id, course_type, course_level, price, deadline, created_at FROM course",
    );
    push_filters(&mut select, filter);
    select
        .push(" ORDER BY created_at DESC, id DESC LIMIT ")
        .push_bind(PAGE_SIZE)
        .push(" OFFSET ")
        .push_bind((page - 1) * PAGE_SIZE);
    let courses = select.build_query_as::<Course>().fetch_all(database).await?;
    Ok(CoursePage {
        courses,
        page,
        total_pages,
        total,
    })
}

pub async fn list_categories(database: &SqlitePool) -> Result<Vec<Category>> {
    let categories =
        sqlx::query_as::<_, Category>("SELECT id, name, description FROM category ORDER BY name")
            .fetch_all(database)
            .await?;
    Ok(categories)
}

pub async fn course_detail(database: &SqlitePool, course_id: i64) -> Result<CourseDetail> {
    let mut conn = database.acquire().await?;
    let course = get_course(&mut conn, course_id).await?;
    let mut sections = Vec::new();
    for section in course_sections(&mut conn, course_id).await? {
        let topics = section_topics(&mut conn, section.id).await?;
        sections.push(SectionOutline { section, topics });
    }

    let reviews = sqlx::query_as::<_, Review>(
        "SELECT id, course_id, student_id, rating, comment, created_at, updated_at FROM review \
         WHERE course_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(course_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut star_counts = [0i64; 5];
    for review in &reviews {
        if let Some(slot) = star_counts.get_mut((review.rating - 1) as usize) {
            *slot += 1;
        }
    }
    let average_rating = (!reviews.is_empty())
        .then(|| reviews.iter().map(|r| r.rating as f64).sum::<f64>() / reviews.len() as f64);

    let related = match course.category_id {
        Some(category_id) => {
            sqlx::query_as::<_, Course>(
                "SELECT id, title, description, category_id, course_type, course_level, price, deadline, created_at \
                 FROM course WHERE category_id = ? AND id != ? ORDER BY created_at DESC, id DESC LIMIT ?",
            )
            .bind(category_id)
            .bind(course_id)
            .bind(RELATED_COURSES)
            .fetch_all(&mut *conn)
            .await?
        }
        None => Vec::new(),
    };

    Ok(CourseDetail {
        course,
        sections,
        average_rating,
        star_counts,
        reviews,
        related,
    })
}

/// Create or replace the student's review of a course they are enrolled in.
pub async fn submit_review(
    database: &SqlitePool,
    student_id: i64,
    course_id: i64,
    rating: i64,
    comment: &str,
) -> Result<ReviewOutcome> {
    if !(1..=5).contains(&rating) {
        return Err(Error::InvalidRating(rating));
    }
    if comment.trim().is_empty() {
        return Err(Error::InvalidContent("review comment is empty".to_string()));
    }
    let mut tx = database.begin().await?;
    if find_enrollment(&mut tx, student_id, course_id).await?.is_none() {
        return Err(Error::NotEnrolled {
            student_id,
            course_id,
        });
    }
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM review WHERE course_id = ? AND student_id = ?")
            .bind(course_id)
            .bind(student_id)
            .fetch_optional(&mut *tx)
            .await?;
    let now = now();
    let id = match existing {
        Some(id) => {
            sqlx::query("UPDATE review SET rating = ?, comment = ?, updated_at = ? WHERE id = ?")
                .bind(rating)
                .bind(comment)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            id
        }
        None => sqlx::query(
            "INSERT INTO review (course_id, student_id, rating, comment, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(course_id)
        .bind(student_id)
        .bind(rating)
        .bind(comment)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid(),
    };
    let review = sqlx::query_as::<_, Review>(
        "SELECT id, course_id, student_id, rating, comment, created_at, updated_at FROM review WHERE id = ?",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    info!(
        "student {} reviewed course {} with {} stars",
        student_id, course_id, rating
    );
    Ok(match existing {
        Some(_) => ReviewOutcome::Updated(review),
        None => ReviewOutcome::Created(review),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::authoring::{CourseDefinition, import_course};
    use crate::db::connect_memory;
    use crate::enrollment::enroll_free;
    use crate::progress::ProgressEngine;
    use crate::student::create_student;

    async fn course(database: &SqlitePool, title: &str, course_type: &str, price: i64) -> i64 {
        let definition = CourseDefinition::from_toml(&format!(
            "title = \"{title}\"\ncategory = \"Languages\"\ncourse_type = \"{course_type}\"\nprice = {price}\n\
             [[section]]\ntitle = \"Intro\"\n[[section.topic]]\ntitle = \"Hello\"\n"
        ))
        .unwrap();
        import_course(database, &definition).await.unwrap()
    }

    #[tokio::test]
    async fn filters_and_pages() {
        let database = connect_memory().await.unwrap();
        for i in 0..14 {
            course(&database, &format!("Rust {i}"), "locked", i * 100).await;
        }
        course(&database, "Go for gophers", "unlocked", 0).await;

        let page = list_courses(&database, &CourseFilter::default()).await.unwrap();
        assert_eq!(page.total, 15);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.courses.len(), 12);
        assert_eq!(page.courses[0].title, "Go for gophers");

        let last = list_courses(
            &database,
            &CourseFilter {
                page: Some(99),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(last.page, 2);
        assert_eq!(last.courses.len(), 3);

        let filtered = list_courses(
            &database,
            &CourseFilter {
                search: Some("rust".to_string()),
                course_type: Some(CourseType::Locked),
                min_price: Some(500),
                max_price: Some(800),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(filtered.total, 4);
    }

    #[tokio::test]
    async fn reviews_require_enrollment_and_upsert() {
        let database = connect_memory().await.unwrap();
        let course_id = course(&database, "Rust", "locked", 0).await;
        let related_id = course(&database, "Rust 2", "locked", 0).await;
        let student_id = create_student(&database, "Ana", "ana@example.com").await.unwrap();

        let err = submit_review(&database, student_id, course_id, 5, "great")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotEnrolled { .. }));

        let progress = ProgressEngine::new(database.clone());
        enroll_free(&progress, student_id, course_id).await.unwrap();
        let err = submit_review(&database, student_id, course_id, 6, "great")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRating(6)));

        let first = submit_review(&database, student_id, course_id, 4, "good")
            .await
            .unwrap();
        assert!(matches!(first, ReviewOutcome::Created(_)));
        let second = submit_review(&database, student_id, course_id, 2, "meh")
            .await
            .unwrap();
        assert!(matches!(second, ReviewOutcome::Updated(ref r) if r.rating == 2));

        let detail = course_detail(&database, course_id).await.unwrap();
        assert_eq!(detail.reviews.len(), 1);
        assert_eq!(detail.star_counts, [0, 1, 0, 0, 0]);
        assert_eq!(detail.average_rating, Some(2.0));
        assert_eq!(detail.sections.len(), 1);
        assert_eq!(detail.related.len(), 1);
        assert_eq!(detail.related[0].id, related_id);
    }
}
