pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("student {student_id} is not enrolled in course {course_id}")]
    NotEnrolled { student_id: i64, course_id: i64 },
    #[error("enrollment {0} is paused")]
    EnrollmentPaused(i64),
    #[error("progress records missing for enrollment {0}")]
    ProgressNotInitialized(i64),
    #[error("topic {0} is locked, complete the previous topics first")]
    TopicLocked(i64),
    #[error("course {course_id} costs {price}, payment is required")]
    PaymentRequired { course_id: i64, price: i64 },
    #[error("payment order id mismatch: expected {expected}, got {received}")]
    PaymentMismatch { expected: String, received: String },
    #[error("payment failed: {0}")]
    PaymentFailed(String),
    #[error("no pending payment in session")]
    PaymentSessionMissing,
    #[error("quiz {0} has no questions")]
    EmptyQuiz(i64),
    #[error("quiz {0} is not active")]
    QuizInactive(i64),
    #[error("quiz attempt {0} is already completed")]
    AttemptClosed(i64),
    #[error("quiz attempt {0} is still in progress")]
    AttemptInProgress(i64),
    #[error("answer {answer_id} does not belong to question {question_id}")]
    InvalidAnswerReference { question_id: i64, answer_id: i64 },
    #[error("question {index} is unanswered")]
    UnansweredQuestions { index: usize },
    #[error("question index {index} out of range 0..{count}")]
    QuestionIndexOutOfRange { index: usize, count: usize },
    #[error("course not complete: {completed}/{total} topics")]
    CourseNotComplete { completed: i64, total: i64 },
    #[error("invalid content: {0}")]
    InvalidContent(String),
    #[error("rating must be between 1 and 5, got {0}")]
    InvalidRating(i64),
    #[error("{0} belongs to another student")]
    Forbidden(String),
    #[error("concurrent update on course progress {0}")]
    Conflict(i64),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Fatal error: {0}")]
    Fatal(anyhow::Error),
}

impl Error {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
