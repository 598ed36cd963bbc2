use std::path::PathBuf;

use clap::Parser;
use course_server::{
    catalog::{
        authoring::{CourseDefinition, import_course},
        browse::{CourseFilter, course_detail, list_courses},
        course::CourseType,
    },
    certificate::CertificateIssue,
    config::Config,
    enrollment::{EnrollOutcome, EnrollmentStatus, enroll_free, set_enrollment_status},
    quiz::{QuizEngine, QuizStart},
    server::Server,
    student::{create_student, delete_student, get_student_courses, get_student_list},
    utils::init_log,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, clap::Parser)]
#[command(author, version, about = "Administer the course platform", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Configuration file
    #[arg(short, long, default_value = "course.toml")]
    config: PathBuf,
    /// Overrides the configured database url
    #[arg(short, long)]
    database: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    Course {
        #[command(subcommand)]
        command: CourseCommand,
    },
    Student {
        #[command(subcommand)]
        command: StudentCommand,
    },
    /// Enroll a student in a free course
    Enroll { student: i64, course: i64 },
    /// Pause or resume an enrollment
    Enrollment {
        id: i64,
        #[arg(value_enum)]
        status: StatusArg,
    },
    /// Show a student's progress in a course
    Progress { student: i64, course: i64 },
    /// Mark a topic completed
    Complete { student: i64, topic: i64 },
    /// Take a quiz interactively
    Quiz { student: i64, quiz: i64 },
    /// Issue the certificate of a completed enrollment
    Certificate { enrollment: i64 },
}

#[derive(Debug, clap::Subcommand)]
enum CourseCommand {
    List {
        #[arg(short, long)]
        search: Option<String>,
        #[arg(short, long)]
        unlocked: bool,
        #[arg(short, long, default_value = "1")]
        page: i64,
    },
    /// Import a course from a TOML definition
    Import { file: PathBuf },
    Show { id: i64 },
}

#[derive(Debug, clap::Subcommand)]
enum StudentCommand {
    List,
    Create {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
    },
    Delete {
        id: i64,
    },
    Courses {
        id: i64,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StatusArg {
    Active,
    Paused,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut config = match Config::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:?}", e);
            return;
        }
    };
    if let Some(url) = &args.database {
        config.database_url = url.clone();
    }
    let _guard = match init_log(config.log_dir.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:?}", e);
            return;
        }
    };
    if let Err(e) = run(args, config).await {
        eprintln!("{:?}", e);
    }
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let server: Server = Server::open(config).await?;
    let database = server.database().clone();

    match args.command {
        Commands::Course { command } => match command {
            CourseCommand::List {
                search,
                unlocked,
                page,
            } => {
                let filter = CourseFilter {
                    search,
                    course_type: unlocked.then_some(CourseType::Unlocked),
                    page: Some(page),
                    ..Default::default()
                };
                let page = list_courses(&database, &filter).await?;
                for course in &page.courses {
                    println!("{:<8} {:<40} {:>8}", course.id, course.title, course.price);
                }
                println!("page {}/{} ({} courses)", page.page, page.total_pages, page.total);
            }
            CourseCommand::Import { file } => {
                println!("Importing course from file: {}", file.display());
                let content = tokio::fs::read_to_string(&file).await?;
                let definition = CourseDefinition::from_toml(&content)?;
                let id = import_course(&database, &definition).await?;
                println!("Course created with id: {}", id);
            }
            CourseCommand::Show { id } => {
                let detail = course_detail(&database, id).await?;
                println!("{} [{:?}, {:?}]", detail.course.title, detail.course.course_type, detail.course.course_level);
                for outline in &detail.sections {
                    println!("  {:<6} {}", outline.section.id, outline.section.title);
                    for topic in &outline.topics {
                        println!("    {:<6} {} ({:?})", topic.id, topic.title, topic.content_type);
                    }
                }
                if let Some(rating) = detail.average_rating {
                    println!("rating {:.1} from {} reviews", rating, detail.reviews.len());
                }
            }
        },
        Commands::Student { command } => match command {
            StudentCommand::List => {
                for student in get_student_list(&database).await? {
                    println!("{:<8} {:<24} {}", student.id, student.name, student.email);
                }
            }
            StudentCommand::Create { name, email } => {
                let id = create_student(&database, &name, &email).await?;
                println!("Student created with id: {}", id);
            }
            StudentCommand::Delete { id } => {
                delete_student(&database, id).await?;
                println!("Student deleted with id: {}", id);
            }
            StudentCommand::Courses { id } => {
                for course in get_student_courses(&database, id).await? {
                    let state = if course.completed_at.is_some() { "completed" } else { "" };
                    println!(
                        "{:<8} {:<40} {:>6.2}% {}",
                        course.enrollment_id, course.title, course.progress_percentage, state
                    );
                }
            }
        },
        Commands::Enroll { student, course } => {
            match enroll_free(server.progress(), student, course).await? {
                EnrollOutcome::Enrolled(e) => println!("Enrolled with id: {}", e.id),
                EnrollOutcome::AlreadyEnrolled(e) => println!("Already enrolled with id: {}", e.id),
            }
        }
        Commands::Enrollment { id, status } => {
            let status = match status {
                StatusArg::Active => EnrollmentStatus::Active,
                StatusArg::Paused => EnrollmentStatus::Paused,
            };
            let enrollment = set_enrollment_status(server.progress(), id, status).await?;
            println!("Enrollment {} is now {:?}", enrollment.id, enrollment.status);
        }
        Commands::Progress { student, course } => {
            let overview = server.progress().course_overview(student, course).await?;
            println!(
                "{}: {:.2}%{}",
                overview.course.title,
                overview.progress.progress_percentage,
                if overview.progress.completed { " (completed)" } else { "" }
            );
            for section in &overview.sections {
                println!("  {} {}", marker(section.progress.completed, section.progress.is_active), section.section.title);
                for topic in &section.topics {
                    println!(
                        "    {} {:<6} {}",
                        marker(topic.progress.completed, topic.progress.is_active),
                        topic.topic.id,
                        topic.topic.title
                    );
                }
            }
            if let Some(topic) = overview.resume_topic_id {
                println!("continue with topic {}", topic);
            }
        }
        Commands::Complete { student, topic } => {
            let done = server.progress().mark_topic_completed(student, topic).await?;
            println!("progress {:.2}%", done.progress_percentage);
            if let Some(activated) = done.activated {
                println!("unlocked {:?}", activated);
            }
            if done.course_newly_completed {
                println!("course completed");
            }
        }
        Commands::Quiz { student, quiz } => {
            take_quiz(server.quiz(), student, quiz).await?;
        }
        Commands::Certificate { enrollment } => {
            match server.certificates().issue_certificate(enrollment).await? {
                CertificateIssue::Issued(c) => {
                    println!("Issued {} at {}", c.certificate_id, c.file_path.unwrap_or_default())
                }
                CertificateIssue::AlreadyCertified(c) => {
                    println!("Already certified: {}", c.certificate_id)
                }
            }
        }
    }
    Ok(())
}

fn marker(completed: bool, active: bool) -> &'static str {
    match (completed, active) {
        (true, _) => "[x]",
        (false, true) => "[ ]",
        (false, false) => "[-]",
    }
}

/// Walk the questions one by one: a number answers, `n`/`p` move, `g <i>`
/// jumps, `done` submits.
async fn take_quiz(engine: &QuizEngine, student: i64, quiz: i64) -> anyhow::Result<()> {
    let attempt = match engine.start_quiz(student, quiz).await? {
        QuizStart::Started(attempt) => attempt,
        QuizStart::Exhausted { last_attempt } => {
            println!(
                "No attempts left, last score {} ({})",
                last_attempt.score,
                if last_attempt.is_passed { "passed" } else { "failed" }
            );
            return Ok(());
        }
    };
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut cursor = engine.attempt_state(student, attempt.id).await?.cursor();
    loop {
        let state = engine.attempt_state(student, attempt.id).await?;
        if state.attempt.is_completed() {
            println!("Attempt {} is closed.", attempt.id);
            break;
        }
        let current = &state.questions[cursor.index()];
        println!(
            "\n[{}/{}] {}",
            cursor.index() + 1,
            cursor.count(),
            current.question.text
        );
        for (i, answer) in current.question.answers.iter().enumerate() {
            let chosen = if current.selected_answer_id == Some(answer.id) { "*" } else { " " };
            println!(" {}{}. {}", chosen, i + 1, answer.text);
        }
        if let Some(seconds) = state.remaining_seconds {
            println!("{}s left", seconds);
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "n" => {
                cursor.next();
            }
            "p" => {
                cursor.previous();
            }
            "done" => match engine.complete_quiz(student, attempt.id).await {
                Ok(_) => break,
                Err(e) => println!("{}", e),
            },
            _ => {
                if let Some(index) = line.strip_prefix("g ").and_then(|i| i.trim().parse::<usize>().ok()) {
                    if let Err(e) = cursor.jump(index.saturating_sub(1)) {
                        println!("{}", e);
                    }
                } else if let Some(answer) = line
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| current.question.answers.get(n.wrapping_sub(1)))
                {
                    engine
                        .submit_answer(student, attempt.id, current.question.id, answer.id)
                        .await?;
                    cursor.next();
                } else {
                    println!("answer with a number, or n / p / g <i> / done");
                }
            }
        }
    }
    let result = engine.quiz_result(student, attempt.id).await?;
    println!(
        "Score {} ({}/{}, {}/{} marks), {}. {} attempts left.",
        result.score.score,
        result.score.correct,
        result.score.total,
        result.marks_earned,
        result.total_marks,
        if result.attempt.is_passed { "passed" } else { "failed" },
        result.attempts_remaining
    );
    Ok(())
}
