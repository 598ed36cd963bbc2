//! Quiz attempts: `in_progress → completed`, never reopened.
//!
//! Deadlines are not timed; an attempt past its time limit is completed by
//! whichever operation touches it first.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::catalog::quiz::{Question, Quiz, get_quiz, question_count, quiz_questions, total_marks};
use crate::error::{Error, Result};
use crate::progress::{ProgressEngine, TopicCompletion};
use crate::utils::now;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct QuizAttempt {
    pub id: i64,
    pub student_id: i64,
    pub quiz_id: i64,
    pub score: i64,
    pub is_passed: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl QuizAttempt {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Whether the time limit of `quiz` has run out at `at`.
    pub fn is_expired(&self, quiz: &Quiz, at: OffsetDateTime) -> bool {
        quiz.time_limit()
            .is_some_and(|limit| at - self.started_at > limit)
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum QuizStart {
    Started(QuizAttempt),
    /// Every allowed attempt is used up
    Exhausted { last_attempt: QuizAttempt },
}

/// Correct answers out of the quiz's questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Score {
    pub correct: i64,
    pub total: i64,
    pub score: i64,
}

impl Score {
    pub fn new(correct: i64, total: i64) -> Self {
        let correct = correct.clamp(0, total.max(0));
        // round half up without floats
        let score = if total > 0 {
            (200 * correct + total) / (2 * total)
        } else {
            0
        };
        Self {
            correct,
            total,
            score,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuizCompletion {
    pub attempt: QuizAttempt,
    /// Set when passing this attempt completed the quiz's topic
    pub topic_completion: Option<TopicCompletion>,
}

/// Position within the questions of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuizCursor {
    index: usize,
    count: usize,
}

impl QuizCursor {
    pub fn new(count: usize) -> Self {
        Self { index: 0, count }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns false when already on the last question.
    pub fn next(&mut self) -> bool {
        if self.index + 1 < self.count {
            self.index += 1;
            true
        } else {
            false
        }
    }

    /// Returns false when already on the first question.
    pub fn previous(&mut self) -> bool {
        if self.index > 0 {
            self.index -= 1;
            true
        } else {
            false
        }
    }

    pub fn jump(&mut self, index: usize) -> Result<()> {
        if index >= self.count {
            return Err(Error::QuestionIndexOutOfRange {
                index,
                count: self.count,
            });
        }
        self.index = index;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionState {
    pub question: Question,
    pub selected_answer_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptState {
    pub attempt: QuizAttempt,
    pub quiz: Quiz,
    pub questions: Vec<QuestionState>,
    pub answered: usize,
    /// `None` without a time limit
    pub remaining_seconds: Option<i64>,
}

impl AttemptState {
    pub fn cursor(&self) -> QuizCursor {
        QuizCursor::new(self.questions.len())
    }

    pub fn total(&self) -> usize {
        self.questions.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionReview {
    pub question_id: i64,
    pub text: String,
    pub selected_answer_id: Option<i64>,
    pub correct_answer_id: Option<i64>,
    pub is_correct: bool,
    pub mark: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuizResult {
    pub attempt: QuizAttempt,
    pub quiz: Quiz,
    pub score: Score,
    pub review: Vec<QuestionReview>,
    /// Marks of the correctly answered questions, out of `total_marks`
    pub marks_earned: i64,
    pub total_marks: i64,
    pub attempts_used: i64,
    pub attempts_remaining: i64,
}

const ATTEMPT_COLUMNS: &str = "id, student_id, quiz_id, score, is_passed, started_at, completed_at";

async fn get_attempt(conn: &mut SqliteConnection, attempt_id: i64) -> Result<QuizAttempt> {
    sqlx::query_as::<_, QuizAttempt>(&format!(
        "SELECT {ATTEMPT_COLUMNS} FROM quiz_attempt WHERE id = ?"
    ))
    .bind(attempt_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::not_found("quiz attempt", attempt_id))
}

async fn count_attempts(conn: &mut SqliteConnection, student_id: i64, quiz_id: i64) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM quiz_attempt WHERE student_id = ? AND quiz_id = ?")
        .bind(student_id)
        .bind(quiz_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Selected answer per question of an attempt.
async fn selected_answers(conn: &mut SqliteConnection, attempt_id: i64) -> Result<HashMap<i64, i64>> {
    let rows: Vec<(i64, i64)> =
        sqlx::query_as("SELECT question_id, answer_id FROM selected_answer WHERE attempt_id = ?")
            .bind(attempt_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(rows.into_iter().collect())
}

/// Score an attempt from its stored answers. Reads only.
pub async fn calculate_score(conn: &mut SqliteConnection, attempt_id: i64) -> Result<Score> {
    let attempt = get_attempt(conn, attempt_id).await?;
    let total = question_count(conn, attempt.quiz_id).await?;
    let correct: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM selected_answer \
         INNER JOIN answer ON answer.id = selected_answer.answer_id AND answer.question_id = selected_answer.question_id \
         INNER JOIN quiz_question ON quiz_question.question_id = selected_answer.question_id AND quiz_question.quiz_id = ? \
         WHERE selected_answer.attempt_id = ? AND answer.is_correct",
    )
    .bind(attempt.quiz_id)
    .bind(attempt_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(Score::new(correct, total))
}

#[derive(Debug, Clone)]
pub struct QuizEngine {
    progress: ProgressEngine,
}

impl QuizEngine {
    pub fn new(progress: ProgressEngine) -> Self {
        Self { progress }
    }

    /// Begin a new attempt, or report the last one when none are left.
    ///
    /// A quiz without questions cannot be started. An attempt that is already
    /// open when its quiz loses every question closes with score 0 the next
    /// time it is touched.
    pub async fn start_quiz(&self, student_id: i64, quiz_id: i64) -> Result<QuizStart> {
        let quiz = {
            let mut conn = self.progress.database().acquire().await?;
            get_quiz(&mut conn, quiz_id).await?
        };
        if !quiz.is_active {
            return Err(Error::QuizInactive(quiz.id));
        }
        // enrollment, pause and lock checks of the quiz's topic
        self.progress.open_topic(student_id, quiz.topic_id).await?;

        let mut tx = self.progress.database().begin().await?;
        if question_count(&mut tx, quiz.id).await? == 0 {
            return Err(Error::EmptyQuiz(quiz.id));
        }
        let inserted = sqlx::query(
            "INSERT INTO quiz_attempt (student_id, quiz_id, started_at) SELECT ?, ?, ? \
             WHERE (SELECT COUNT(*) FROM quiz_attempt WHERE student_id = ? AND quiz_id = ?) < ?",
        )
        .bind(student_id)
        .bind(quiz.id)
        .bind(now())
        .bind(student_id)
        .bind(quiz.id)
        .bind(quiz.attempts_allowed)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            let last = sqlx::query_as::<_, QuizAttempt>(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM quiz_attempt WHERE student_id = ? AND quiz_id = ? \
                 ORDER BY started_at DESC, id DESC LIMIT 1"
            ))
            .bind(student_id)
            .bind(quiz.id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            info!(
                "student {} has used all {} attempts of quiz {}",
                student_id, quiz.attempts_allowed, quiz.id
            );
            let (last_attempt, _) = self.settle_expired(last, &quiz).await?;
            return Ok(QuizStart::Exhausted { last_attempt });
        }
        let attempt = get_attempt(&mut tx, inserted.last_insert_rowid()).await?;
        tx.commit().await?;
        info!(
            "student {} started attempt {} of quiz {}-{}",
            student_id, attempt.id, quiz.id, quiz.name
        );
        Ok(QuizStart::Started(attempt))
    }

    /// Load an attempt owned by `student_id` together with its quiz.
    async fn owned_attempt(&self, student_id: i64, attempt_id: i64) -> Result<(QuizAttempt, Quiz)> {
        let mut conn = self.progress.database().acquire().await?;
        let attempt = get_attempt(&mut conn, attempt_id).await?;
        if attempt.student_id != student_id {
            return Err(Error::Forbidden(format!("quiz attempt {attempt_id}")));
        }
        let quiz = get_quiz(&mut conn, attempt.quiz_id).await?;
        Ok((attempt, quiz))
    }

    /// Complete an open attempt that ran out of time or lost all its
    /// questions. Other attempts are returned unchanged.
    async fn settle_expired(&self, attempt: QuizAttempt, quiz: &Quiz) -> Result<(QuizAttempt, Option<TopicCompletion>)> {
        if attempt.is_completed() {
            return Ok((attempt, None));
        }
        let empty = {
            let mut conn = self.progress.database().acquire().await?;
            question_count(&mut conn, quiz.id).await? == 0
        };
        if !attempt.is_expired(quiz, now()) && !empty {
            return Ok((attempt, None));
        }
        if empty {
            warn!("quiz {} lost its questions, closing attempt {}", quiz.id, attempt.id);
        } else {
            info!("attempt {} ran out of time", attempt.id);
        }
        self.finish(attempt.id, quiz).await
    }

    /// Record (or replace) the answer to one question of an open attempt.
    pub async fn submit_answer(
        &self,
        student_id: i64,
        attempt_id: i64,
        question_id: i64,
        answer_id: i64,
    ) -> Result<QuizAttempt> {
        let (attempt, quiz) = self.owned_attempt(student_id, attempt_id).await?;
        let (attempt, _) = self.settle_expired(attempt, &quiz).await?;
        if attempt.is_completed() {
            return Err(Error::AttemptClosed(attempt.id));
        }
        let mut tx = self.progress.database().begin().await?;
        let valid: Option<i64> = sqlx::query_scalar(
            "SELECT answer.id FROM answer \
             INNER JOIN quiz_question ON quiz_question.question_id = answer.question_id \
             WHERE answer.id = ? AND answer.question_id = ? AND quiz_question.quiz_id = ?",
        )
        .bind(answer_id)
        .bind(question_id)
        .bind(quiz.id)
        .fetch_optional(&mut *tx)
        .await?;
        if valid.is_none() {
            return Err(Error::InvalidAnswerReference {
                question_id,
                answer_id,
            });
        }
        // the attempt may have been completed since it was loaded
        let result = sqlx::query(
            "INSERT INTO selected_answer (attempt_id, question_id, answer_id) \
             SELECT ?, ?, ? WHERE EXISTS (SELECT 1 FROM quiz_attempt WHERE id = ? AND completed_at IS NULL) \
             ON CONFLICT (attempt_id, question_id) DO UPDATE SET answer_id = excluded.answer_id",
        )
        .bind(attempt.id)
        .bind(question_id)
        .bind(answer_id)
        .bind(attempt.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::AttemptClosed(attempt.id));
        }
        tx.commit().await?;
        Ok(attempt)
    }

    /// Finish an attempt on the student's request. Every question must be
    /// answered. Completing an already completed attempt returns it as is.
    pub async fn complete_quiz(&self, student_id: i64, attempt_id: i64) -> Result<QuizCompletion> {
        let (attempt, quiz) = self.owned_attempt(student_id, attempt_id).await?;
        let (attempt, topic_completion) = self.settle_expired(attempt, &quiz).await?;
        if attempt.is_completed() {
            // a pass whose topic completion failed earlier is applied again
            let topic_completion = match topic_completion {
                None if attempt.is_passed => self.complete_quiz_topic(student_id, &quiz).await?,
                completion => completion,
            };
            return Ok(QuizCompletion {
                attempt,
                topic_completion,
            });
        }
        {
            let mut conn = self.progress.database().acquire().await?;
            let selected = selected_answers(&mut conn, attempt.id).await?;
            let questions = quiz_questions(&mut conn, quiz.id).await?;
            if let Some(index) = questions.iter().position(|q| !selected.contains_key(&q.id)) {
                return Err(Error::UnansweredQuestions { index });
            }
        }
        let (attempt, topic_completion) = self.finish(attempt.id, &quiz).await?;
        Ok(QuizCompletion {
            attempt,
            topic_completion,
        })
    }

    /// Score and close an attempt, then complete the quiz's topic on a pass.
    async fn finish(&self, attempt_id: i64, quiz: &Quiz) -> Result<(QuizAttempt, Option<TopicCompletion>)> {
        let mut tx = self.progress.database().begin().await?;
        let score = calculate_score(&mut tx, attempt_id).await?;
        let is_passed = score.total > 0 && score.score >= quiz.passing_score;
        let closed = sqlx::query(
            "UPDATE quiz_attempt SET score = ?, is_passed = ?, completed_at = ? WHERE id = ? AND completed_at IS NULL",
        )
        .bind(score.score)
        .bind(is_passed)
        .bind(now())
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;
        let attempt = get_attempt(&mut tx, attempt_id).await?;
        tx.commit().await?;
        if !closed {
            return Ok((attempt, None));
        }
        info!(
            "attempt {} of quiz {} scored {} ({}/{}), passed: {}",
            attempt.id, quiz.id, score.score, score.correct, score.total, is_passed
        );
        let topic_completion = if attempt.is_passed {
            self.complete_quiz_topic(attempt.student_id, quiz).await?
        } else {
            None
        };
        Ok((attempt, topic_completion))
    }

    async fn complete_quiz_topic(&self, student_id: i64, quiz: &Quiz) -> Result<Option<TopicCompletion>> {
        let completed: Option<bool> = {
            let mut conn = self.progress.database().acquire().await?;
            sqlx::query_scalar(
                "SELECT topic_progress.completed FROM topic_progress \
                 INNER JOIN section_progress ON section_progress.id = topic_progress.section_progress_id \
                 INNER JOIN course_progress ON course_progress.id = section_progress.course_progress_id \
                 INNER JOIN enrollment ON enrollment.id = course_progress.enrollment_id \
                 WHERE enrollment.student_id = ? AND topic_progress.topic_id = ?",
            )
            .bind(student_id)
            .bind(quiz.topic_id)
            .fetch_optional(&mut *conn)
            .await?
        };
        if completed == Some(true) {
            return Ok(None);
        }
        let completion = self
            .progress
            .mark_topic_completed(student_id, quiz.topic_id)
            .await?;
        Ok(Some(completion))
    }

    /// Current answers of an attempt and the time left.
    pub async fn attempt_state(&self, student_id: i64, attempt_id: i64) -> Result<AttemptState> {
        let (attempt, quiz) = self.owned_attempt(student_id, attempt_id).await?;
        let (attempt, _) = self.settle_expired(attempt, &quiz).await?;
        let mut conn = self.progress.database().acquire().await?;
        let mut selected = selected_answers(&mut conn, attempt.id).await?;
        let questions: Vec<QuestionState> = quiz_questions(&mut conn, quiz.id)
            .await?
            .into_iter()
            .map(|question| QuestionState {
                selected_answer_id: selected.remove(&question.id),
                question,
            })
            .collect();
        let answered = questions
            .iter()
            .filter(|q| q.selected_answer_id.is_some())
            .count();
        let remaining_seconds = match (quiz.time_limit(), attempt.is_completed()) {
            (Some(_), true) => Some(0),
            (Some(limit), false) => {
                Some((attempt.started_at + limit - now()).whole_seconds().max(0))
            }
            (None, _) => None,
        };
        Ok(AttemptState {
            attempt,
            quiz,
            questions,
            answered,
            remaining_seconds,
        })
    }

    /// Review of a completed attempt.
    pub async fn quiz_result(&self, student_id: i64, attempt_id: i64) -> Result<QuizResult> {
        let (attempt, quiz) = self.owned_attempt(student_id, attempt_id).await?;
        let (attempt, _) = self.settle_expired(attempt, &quiz).await?;
        if !attempt.is_completed() {
            return Err(Error::AttemptInProgress(attempt.id));
        }
        if attempt.is_passed {
            if let Err(e) = self.complete_quiz_topic(student_id, &quiz).await {
                warn!("passed attempt {} left topic {} open: {}", attempt.id, quiz.topic_id, e);
            }
        }
        let mut conn = self.progress.database().acquire().await?;
        let score = calculate_score(&mut conn, attempt.id).await?;
        let selected = selected_answers(&mut conn, attempt.id).await?;
        let review = quiz_questions(&mut conn, quiz.id)
            .await?
            .into_iter()
            .map(|question| {
                let selected_answer_id = selected.get(&question.id).copied();
                let correct_answer_id = question.correct_answer().map(|a| a.id);
                QuestionReview {
                    question_id: question.id,
                    text: question.text,
                    selected_answer_id,
                    correct_answer_id,
                    is_correct: selected_answer_id.is_some() && selected_answer_id == correct_answer_id,
                    mark: question.mark,
                }
            })
            .collect::<Vec<_>>();
        let marks_earned: i64 = review.iter().filter(|r| r.is_correct).map(|r| r.mark).sum();
        let total_marks = total_marks(&mut conn, quiz.id).await?;
        let attempts_used = count_attempts(&mut conn, student_id, quiz.id).await?;
        Ok(QuizResult {
            marks_earned,
            total_marks,
            attempts_remaining: (quiz.attempts_allowed - attempts_used).max(0),
            attempts_used,
            attempt,
            quiz,
            score,
            review,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::course::get_topic;
    use crate::enrollment::{EnrollmentStatus, set_enrollment_status};
    use crate::fixtures::{CourseTree, enroll, import, setup, student};

    const QUIZ_COURSE: &str = r#"
title = "Quizzed"
[[section]]
title = "Only"
[[section.topic]]
title = "Reading"
[[section.topic]]
title = "Check"
[section.topic.quiz]
name = "Check"
attempts_allowed = 4
duration_minutes = 10
passing_score = 70
[[section.topic.quiz.question]]
text = "q1"
answer = [{ text = "right", correct = true }, { text = "wrong" }]
[[section.topic.quiz.question]]
text = "q2"
answer = [{ text = "right", correct = true }, { text = "wrong" }]
[[section.topic.quiz.question]]
text = "q3"
answer = [{ text = "right", correct = true }, { text = "wrong" }]
[[section.topic.quiz.question]]
text = "q4"
answer = [{ text = "right", correct = true }, { text = "wrong" }]
"#;

    struct QuizSetup {
        database: sqlx::SqlitePool,
        engine: QuizEngine,
        progress: ProgressEngine,
        tree: CourseTree,
        quiz: Quiz,
        questions: Vec<Question>,
        student_id: i64,
    }

    impl QuizSetup {
        fn answer(&self, question: usize, correct: bool) -> (i64, i64) {
            let question = &self.questions[question];
            let answer = question
                .answers
                .iter()
                .find(|a| a.is_correct == correct)
                .unwrap();
            (question.id, answer.id)
        }

        async fn start(&self) -> QuizAttempt {
            match self.engine.start_quiz(self.student_id, self.quiz.id).await.unwrap() {
                QuizStart::Started(attempt) => attempt,
                QuizStart::Exhausted { .. } => panic!("attempts exhausted"),
            }
        }

        async fn answer_all(&self, attempt: &QuizAttempt, correct: usize) {
            for index in 0..self.questions.len() {
                let (question_id, answer_id) = self.answer(index, index < correct);
                self.engine
                    .submit_answer(self.student_id, attempt.id, question_id, answer_id)
                    .await
                    .unwrap();
            }
        }
    }

    async fn quiz_setup(course_type: &str) -> QuizSetup {
        let (database, progress) = setup().await;
        let tree = import(
            &database,
            &QUIZ_COURSE.replace("title = \"Quizzed\"", &format!("title = \"Quizzed\"\ncourse_type = \"{course_type}\"")),
        )
        .await;
        let student_id = student(&database, "ana").await;
        enroll(&progress, student_id, tree.course_id).await;
        let (quiz, questions) = {
            let mut conn = database.acquire().await.unwrap();
            let quiz = get_topic(&mut conn, tree.topics[0][1]).await.unwrap().quiz.unwrap();
            let questions = quiz_questions(&mut conn, quiz.id).await.unwrap();
            (quiz, questions)
        };
        QuizSetup {
            engine: QuizEngine::new(progress.clone()),
            database,
            progress,
            tree,
            quiz,
            questions,
            student_id,
        }
    }

    #[test]
    fn score_rounds_half_up() {
        assert_eq!(Score::new(3, 4).score, 75);
        assert_eq!(Score::new(2, 3).score, 67);
        assert_eq!(Score::new(1, 8).score, 13);
        assert_eq!(Score::new(0, 0).score, 0);
        assert_eq!(Score::new(5, 4).score, 100);
    }

    #[test]
    fn cursor_stays_in_bounds() {
        let mut cursor = QuizCursor::new(3);
        assert!(!cursor.previous());
        assert!(cursor.next());
        assert!(cursor.next());
        assert!(!cursor.next());
        assert_eq!(cursor.index(), 2);
        cursor.jump(0).unwrap();
        assert_eq!(cursor.index(), 0);
        assert!(matches!(
            cursor.jump(3),
            Err(Error::QuestionIndexOutOfRange { index: 3, count: 3 })
        ));
        assert!(QuizCursor::new(0).jump(0).is_err());
    }

    #[tokio::test]
    async fn fifth_attempt_is_rejected() {
        let s = quiz_setup("unlocked").await;
        let mut last = None;
        for _ in 0..4 {
            let attempt = s.start().await;
            s.answer_all(&attempt, 0).await;
            s.engine.complete_quiz(s.student_id, attempt.id).await.unwrap();
            last = Some(attempt.id);
        }
        match s.engine.start_quiz(s.student_id, s.quiz.id).await.unwrap() {
            QuizStart::Exhausted { last_attempt } => {
                assert_eq!(Some(last_attempt.id), last);
                assert!(last_attempt.is_completed());
                assert!(!last_attempt.is_passed);
            }
            QuizStart::Started(_) => panic!("fifth attempt started"),
        }
        let result = s.engine.quiz_result(s.student_id, last.unwrap()).await.unwrap();
        assert_eq!(result.attempts_used, 4);
        assert_eq!(result.attempts_remaining, 0);
    }

    #[tokio::test]
    async fn three_of_four_scores_75_and_completes_topic() {
        let s = quiz_setup("unlocked").await;
        let attempt = s.start().await;
        s.answer_all(&attempt, 3).await;

        let state = s.engine.attempt_state(s.student_id, attempt.id).await.unwrap();
        assert_eq!((state.answered, state.total()), (4, 4));
        assert!(state.remaining_seconds.unwrap() > 0);

        let done = s.engine.complete_quiz(s.student_id, attempt.id).await.unwrap();
        assert_eq!(done.attempt.score, 75);
        assert!(done.attempt.is_passed);
        let topic = done.topic_completion.expect("topic completed");
        assert_eq!(topic.topic_id, s.tree.topics[0][1]);
        assert!(topic.newly_completed);

        let mut conn = s.database.acquire().await.unwrap();
        let first = calculate_score(&mut conn, attempt.id).await.unwrap();
        let second = calculate_score(&mut conn, attempt.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.score, 75);
        drop(conn);

        let result = s.engine.quiz_result(s.student_id, attempt.id).await.unwrap();
        assert_eq!(result.review.iter().filter(|r| r.is_correct).count(), 3);
        assert_eq!((result.marks_earned, result.total_marks), (3, 4));
        assert_eq!(result.attempts_remaining, 3);

        // completing again is a no-op
        let again = s.engine.complete_quiz(s.student_id, attempt.id).await.unwrap();
        assert_eq!(again.attempt, done.attempt);
        assert!(again.topic_completion.is_none());

        // a later pass does not complete the topic a second time
        let retry = s.start().await;
        s.answer_all(&retry, 4).await;
        let done = s.engine.complete_quiz(s.student_id, retry.id).await.unwrap();
        assert_eq!(done.attempt.score, 100);
        assert!(done.topic_completion.is_none());
    }

    #[tokio::test]
    async fn failing_score_keeps_topic_open() {
        let s = quiz_setup("unlocked").await;
        let attempt = s.start().await;
        s.answer_all(&attempt, 2).await;
        let done = s.engine.complete_quiz(s.student_id, attempt.id).await.unwrap();
        assert_eq!(done.attempt.score, 50);
        assert!(!done.attempt.is_passed);
        assert!(done.topic_completion.is_none());
    }

    #[tokio::test]
    async fn answers_are_validated_and_overwritable() {
        let s = quiz_setup("unlocked").await;
        let attempt = s.start().await;

        let (q1, _) = s.answer(0, true);
        let (_, foreign_answer) = s.answer(1, true);
        let err = s
            .engine
            .submit_answer(s.student_id, attempt.id, q1, foreign_answer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAnswerReference { .. }));

        let (q1, wrong) = s.answer(0, false);
        s.engine.submit_answer(s.student_id, attempt.id, q1, wrong).await.unwrap();
        let (q1, right) = s.answer(0, true);
        s.engine.submit_answer(s.student_id, attempt.id, q1, right).await.unwrap();
        let state = s.engine.attempt_state(s.student_id, attempt.id).await.unwrap();
        assert_eq!(state.answered, 1);
        assert_eq!(state.questions[0].selected_answer_id, Some(right));

        let err = s.engine.complete_quiz(s.student_id, attempt.id).await.unwrap_err();
        assert!(matches!(err, Error::UnansweredQuestions { index: 1 }));

        let other = student(&s.database, "ben").await;
        let err = s.engine.attempt_state(other, attempt.id).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn expired_attempt_completes_on_access() {
        let s = quiz_setup("unlocked").await;
        let attempt = s.start().await;
        for index in 0..3 {
            let (question_id, answer_id) = s.answer(index, true);
            s.engine
                .submit_answer(s.student_id, attempt.id, question_id, answer_id)
                .await
                .unwrap();
        }
        sqlx::query("UPDATE quiz_attempt SET started_at = ? WHERE id = ?")
            .bind(now() - time::Duration::minutes(11))
            .bind(attempt.id)
            .execute(&s.database)
            .await
            .unwrap();

        let (question_id, answer_id) = s.answer(3, true);
        let err = s
            .engine
            .submit_answer(s.student_id, attempt.id, question_id, answer_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AttemptClosed(id) if id == attempt.id));

        let result = s.engine.quiz_result(s.student_id, attempt.id).await.unwrap();
        assert!(result.attempt.is_completed());
        assert_eq!(result.attempt.score, 75);
        assert!(result.attempt.is_passed);
        assert_eq!(result.review[3].selected_answer_id, None);
    }

    #[tokio::test]
    async fn pass_completes_topic_after_enrollment_resumes() {
        let (database, progress) = setup().await;
        let tree = import(
            &database,
            r#"
title = "One shot"
course_type = "unlocked"
[[section]]
title = "Only"
[[section.topic]]
title = "Check"
[section.topic.quiz]
name = "Check"
attempts_allowed = 1
[[section.topic.quiz.question]]
text = "q1"
answer = [{ text = "right", correct = true }, { text = "wrong" }]
"#,
        )
        .await;
        let student_id = student(&database, "ana").await;
        let enrollment = enroll(&progress, student_id, tree.course_id).await;
        let engine = QuizEngine::new(progress.clone());
        let (quiz, question) = {
            let mut conn = database.acquire().await.unwrap();
            let quiz = get_topic(&mut conn, tree.topics[0][0]).await.unwrap().quiz.unwrap();
            let question = quiz_questions(&mut conn, quiz.id).await.unwrap().remove(0);
            (quiz, question)
        };
        let QuizStart::Started(attempt) = engine.start_quiz(student_id, quiz.id).await.unwrap() else {
            panic!("expected a new attempt");
        };
        let right = question.correct_answer().unwrap().id;
        engine
            .submit_answer(student_id, attempt.id, question.id, right)
            .await
            .unwrap();

        set_enrollment_status(&progress, enrollment.id, EnrollmentStatus::Paused)
            .await
            .unwrap();
        let err = engine.complete_quiz(student_id, attempt.id).await.unwrap_err();
        assert!(matches!(err, Error::EnrollmentPaused(_)));
        let result = engine.quiz_result(student_id, attempt.id).await.unwrap();
        assert!(result.attempt.is_passed);
        assert_eq!(result.attempts_remaining, 0);

        set_enrollment_status(&progress, enrollment.id, EnrollmentStatus::Active)
            .await
            .unwrap();
        let done = engine.complete_quiz(student_id, attempt.id).await.unwrap();
        assert!(done.attempt.is_passed);
        let topic = done.topic_completion.expect("topic completed");
        assert!(topic.newly_completed);
        assert!(topic.course_completed);

        let overview = progress.course_overview(student_id, tree.course_id).await.unwrap();
        assert!(overview.sections[0].topics[0].progress.completed);
        assert!(overview.progress.completed);
    }

    #[tokio::test]
    async fn quiz_without_questions() {
        let s = quiz_setup("unlocked").await;
        let attempt = s.start().await;
        sqlx::query("DELETE FROM quiz_question WHERE quiz_id = ?")
            .bind(s.quiz.id)
            .execute(&s.database)
            .await
            .unwrap();

        let done = s.engine.complete_quiz(s.student_id, attempt.id).await.unwrap();
        assert!(done.attempt.is_completed());
        assert_eq!(done.attempt.score, 0);
        assert!(!done.attempt.is_passed);

        let err = s.engine.start_quiz(s.student_id, s.quiz.id).await.unwrap_err();
        assert!(matches!(err, Error::EmptyQuiz(_)));
    }

    #[tokio::test]
    async fn quiz_on_locked_topic_cannot_start() {
        let s = quiz_setup("locked").await;
        let err = s.engine.start_quiz(s.student_id, s.quiz.id).await.unwrap_err();
        assert!(matches!(err, Error::TopicLocked(_)));

        s.progress
            .mark_topic_completed(s.student_id, s.tree.topics[0][0])
            .await
            .unwrap();
        let attempt = s.start().await;
        s.answer_all(&attempt, 4).await;
        let done = s.engine.complete_quiz(s.student_id, attempt.id).await.unwrap();
        assert!(done.topic_completion.unwrap().course_completed);

        sqlx::query("UPDATE quiz SET is_active = 0 WHERE id = ?")
            .bind(s.quiz.id)
            .execute(&s.database)
            .await
            .unwrap();
        let err = s.engine.start_quiz(s.student_id, s.quiz.id).await.unwrap_err();
        assert!(matches!(err, Error::QuizInactive(_)));
    }
}
