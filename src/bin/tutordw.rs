use chrono::Utc;
use clap::{Parser, Subcommand};

use tutordw::{NewFeedback, NewSession, Period, ReportRequest, TutorDW};

#[derive(Parser)]
#[command(name = "tutordw", about = "Tutoring analytics warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.tutordw/tutordw.db, or $TUTORDW_DB)
    #[arg(long, env = "TUTORDW_DB")]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Insert a demo data set through the ingest path
    Seed,
    /// Run the analytics REST API
    Serve {
        /// Bind address
        #[arg(long, default_value = tutordw::http::DEFAULT_BIND)]
        bind: String,
    },
    /// Record a session or feedback row (fires rollup triggers)
    Ingest {
        #[command(subcommand)]
        target: IngestTarget,
    },
    /// Force a rollup recompute for one bucket
    Rollup {
        #[command(subcommand)]
        target: RollupTarget,
    },
    /// Periodic batch jobs (intended for cron)
    Jobs {
        #[command(subcommand)]
        job: Job,
    },
    /// Generate a report over a date range
    Report {
        /// Report type: institution, subject, tutor
        #[arg(long = "type", value_name = "TYPE")]
        kind: String,
        /// Range start (YYYY-MM-DD)
        #[arg(long)]
        start: String,
        /// Range end (YYYY-MM-DD)
        #[arg(long)]
        end: String,
        /// Subject id (for subject reports)
        #[arg(long)]
        subject_id: Option<String>,
        /// Tutor id (for tutor reports)
        #[arg(long)]
        tutor_id: Option<String>,
    },
    /// Show the dashboard payload
    Dashboard,
    /// Show warehouse row counts
    Status,
}

#[derive(Subcommand)]
enum IngestTarget {
    /// Record a tutoring session
    Session {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        subject_id: String,
        #[arg(long)]
        tutor_id: String,
        #[arg(long)]
        student_id: String,
        /// RFC 3339 scheduled start, e.g. 2026-08-05T16:00:00Z
        #[arg(long)]
        scheduled_at: String,
        #[arg(long)]
        duration_hours: Option<f64>,
        /// scheduled, ongoing, completed, or cancelled
        #[arg(long)]
        status: Option<String>,
    },
    /// Record session feedback
    Feedback {
        #[arg(long)]
        feedback_id: String,
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        student_id: String,
        /// Overall rating, 1-5
        #[arg(long)]
        rating: i64,
        #[arg(long, default_value = "")]
        comments: String,
    },
}

#[derive(Subcommand)]
enum RollupTarget {
    /// Recompute a subject rollup
    Subject {
        subject_id: String,
        /// Period (YYYY-MM); defaults to the current month
        #[arg(long)]
        period: Option<String>,
    },
    /// Recompute a tutor rollup
    Tutor {
        tutor_id: String,
        subject_id: String,
        #[arg(long)]
        period: Option<String>,
    },
    /// Recompute a student rollup
    Student {
        student_id: String,
        subject_id: String,
        #[arg(long)]
        period: Option<String>,
    },
    /// Recompute the institution rollup
    Institution {
        #[arg(long)]
        period: Option<String>,
    },
}

#[derive(Subcommand)]
enum Job {
    /// Refresh subject rollups for the previous month
    MonthlyRollups,
    /// Flag students with below-average engagement last month
    RiskAssessments,
}

fn resolve_period(period: Option<&str>) -> anyhow::Result<Period> {
    match period {
        Some(key) => Ok(Period::parse(key)?),
        None => Ok(Period::current(Utc::now().date_naive())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => tutordw::Database::open_at(path).await?,
        None => tutordw::Database::open().await?,
    };
    let dw = TutorDW::new(db);

    match cli.command {
        Commands::InitDb => {
            // Migrations run on open; getting here means the schema is current.
            println!("Schema ready.");
        }
        Commands::Seed => {
            dw.seed_demo(Utc::now().date_naive()).await?;
            println!("Seed data inserted.");
        }
        Commands::Serve { bind } => {
            tutordw::http::serve(dw.db().clone(), &bind).await?;
        }
        Commands::Ingest { target } => match target {
            IngestTarget::Session {
                session_id,
                subject_id,
                tutor_id,
                student_id,
                scheduled_at,
                duration_hours,
                status,
            } => {
                let session = dw
                    .record_session(
                        NewSession {
                            session_id,
                            subject_id,
                            tutor_id,
                            student_id,
                            scheduled_at,
                            duration_hours,
                            status,
                        },
                        Utc::now().date_naive(),
                    )
                    .await?;
                println!("Recorded session {} ({}).", session.session_id, session.status);
            }
            IngestTarget::Feedback {
                feedback_id,
                session_id,
                student_id,
                rating,
                comments,
            } => {
                let feedback = dw
                    .record_feedback(
                        NewFeedback {
                            feedback_id,
                            session_id,
                            student_id,
                            overall_rating: rating,
                            comments,
                        },
                        Utc::now(),
                    )
                    .await?;
                println!(
                    "Recorded feedback {} ({}/5).",
                    feedback.feedback_id, feedback.overall_rating
                );
            }
        },
        Commands::Rollup { target } => match target {
            RollupTarget::Subject { subject_id, period } => {
                let period = resolve_period(period.as_deref())?;
                let rollup = dw.recompute_subject(&subject_id, period).await?;
                println!("{}", serde_json::to_string_pretty(&rollup)?);
            }
            RollupTarget::Tutor {
                tutor_id,
                subject_id,
                period,
            } => {
                let period = resolve_period(period.as_deref())?;
                let rollup = dw.recompute_tutor(&tutor_id, &subject_id, period).await?;
                println!("{}", serde_json::to_string_pretty(&rollup)?);
            }
            RollupTarget::Student {
                student_id,
                subject_id,
                period,
            } => {
                let period = resolve_period(period.as_deref())?;
                let rollup = dw.recompute_student(&student_id, &subject_id, period).await?;
                println!("{}", serde_json::to_string_pretty(&rollup)?);
            }
            RollupTarget::Institution { period } => {
                let period = resolve_period(period.as_deref())?;
                let rollup = dw.recompute_institution(period).await?;
                println!("{}", serde_json::to_string_pretty(&rollup)?);
            }
        },
        Commands::Jobs { job } => match job {
            Job::MonthlyRollups => {
                let report = dw.generate_monthly_rollups(Utc::now().date_naive()).await?;
                println!(
                    "Refreshed {} subjects for {}.",
                    report.subjects_refreshed, report.period
                );
            }
            Job::RiskAssessments => {
                let report = dw.generate_risk_assessments(Utc::now().date_naive()).await?;
                println!(
                    "Flagged {} students for {} (means: {:.2} sessions, {:.2} hours).",
                    report.students_assessed,
                    report.period,
                    report.mean_sessions_attended,
                    report.mean_learning_hours
                );
            }
        },
        Commands::Report {
            kind,
            start,
            end,
            subject_id,
            tutor_id,
        } => {
            let payload = dw
                .generate_report(ReportRequest {
                    kind: Some(kind),
                    start_date: Some(start),
                    end_date: Some(end),
                    subject_id,
                    tutor_id,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Dashboard => {
            let dashboard = dw.dashboard(Utc::now().date_naive()).await?;
            println!("{}", serde_json::to_string_pretty(&dashboard)?);
        }
        Commands::Status => {
            for (table, count) in dw.status().await? {
                println!("{table:<22} {count}");
            }
        }
    }

    Ok(())
}
