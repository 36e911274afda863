use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, info, warn};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use edufam_analytics::attendance;
use edufam_analytics::cache::TieredCache;
use edufam_analytics::competency;
use edufam_analytics::config::AppConfig;
use edufam_analytics::db::{self, PgCacheStore};
use edufam_analytics::error::{DataResult, ErrorKind};
use edufam_analytics::export::{self, ExportFormat};
use edufam_analytics::fetch::{self, LatestRequest, RetryPolicy};
use edufam_analytics::finance;
use edufam_analytics::models::{AttendanceReport, DateRange, FinancialReport, PaymentMethod};
use edufam_analytics::report;

#[derive(Parser)]
#[command(name = "edufam-analytics")]
#[command(about = "Attendance, fee and competency reporting for EduFam schools", long_about = None)]
struct Cli {
    /// JSON config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy)]
struct Window {
    #[arg(long, default_value_t = 30)]
    since_days: i64,
    #[arg(long, requires = "to")]
    from: Option<NaiveDate>,
    #[arg(long, requires = "from")]
    to: Option<NaiveDate>,
}

impl Window {
    fn range(&self) -> anyhow::Result<DateRange> {
        match (self.from, self.to) {
            (Some(start), Some(end)) if start > end => {
                bail!("--from {start} is after --to {end}")
            }
            (Some(start), Some(end)) => Ok(DateRange { start, end }),
            _ => Ok(DateRange::trailing(self.since_days, Utc::now().date_naive())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Dataset {
    AttendanceRows,
    WeeklyTrends,
    Classes,
    AttendanceReport,
    Fees,
    FeeClasses,
    MonthlyCollections,
    PaymentMethods,
    FinanceReport,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo school with attendance, fees and assessments
    Seed,
    /// Import attendance marks from a CSV file
    ImportAttendance {
        #[arg(long)]
        school: Uuid,
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import fee lines from a CSV file
    ImportFees {
        #[arg(long)]
        school: Uuid,
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record a payment against a fee and recompute its status
    RecordPayment {
        #[arg(long)]
        fee: Uuid,
        #[arg(long)]
        amount: f64,
        #[arg(long, default_value = "mpesa")]
        method: String,
        #[arg(long)]
        reference: Option<String>,
    },
    /// Attendance summary, weekly trend and class breakdown
    Attendance {
        #[arg(long)]
        school: Uuid,
        #[command(flatten)]
        window: Window,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Fee collection summary for the trailing six months
    Finance {
        #[arg(long)]
        school: Uuid,
        #[arg(long)]
        academic_year: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Overall CBC level per learning area for one learner
    Competency {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        academic_year: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Attendance and finance markdown combined into one document
    Report {
        #[arg(long)]
        school: Uuid,
        #[arg(long)]
        academic_year: Option<String>,
        #[command(flatten)]
        window: Window,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Headline numbers; sections that fail to load are skipped
    Dashboard {
        #[arg(long)]
        school: Uuid,
        #[command(flatten)]
        window: Window,
    },
    /// Export a dataset as CSV or JSON
    Export {
        #[arg(long)]
        school: Uuid,
        #[arg(long, value_enum)]
        dataset: Dataset,
        #[arg(long, value_enum, default_value = "csv")]
        format: ExportFormat,
        #[arg(long)]
        out: PathBuf,
        #[command(flatten)]
        window: Window,
    },
    /// Re-run the attendance report on an interval until interrupted
    Watch {
        #[arg(long)]
        school: Uuid,
        #[arg(long, default_value_t = 60)]
        every_secs: u64,
        #[command(flatten)]
        window: Window,
    },
}

#[derive(Clone)]
struct App {
    pool: PgPool,
    policy: RetryPolicy,
    cache: Arc<TieredCache<PgCacheStore>>,
    ttl: Duration,
}

impl App {
    fn attendance_key(school_id: Uuid, range: DateRange) -> String {
        format!("attendance:{school_id}:{}:{}", range.start, range.end)
    }

    async fn build_attendance(
        &self,
        school_id: Uuid,
        range: DateRange,
    ) -> DataResult<AttendanceReport> {
        let pool = &self.pool;
        let rows = fetch::with_retry(&self.policy, "attendance", move || {
            db::fetch_attendance(pool, school_id, Some(range))
        })
        .await?;
        Ok(attendance::build_attendance_report(&rows, Some(range)))
    }

    async fn attendance_report(
        &self,
        school_id: Uuid,
        range: DateRange,
    ) -> DataResult<AttendanceReport> {
        let key = Self::attendance_key(school_id, range);
        self.cache
            .get_or_fetch(&key, self.ttl, || self.build_attendance(school_id, range))
            .await
    }

    async fn finance_report(
        &self,
        school_id: Uuid,
        academic_year: Option<&str>,
    ) -> DataResult<FinancialReport> {
        let as_of = Utc::now().date_naive();
        let key = format!(
            "finance:{school_id}:{}:{as_of}",
            academic_year.unwrap_or("all")
        );
        let since = finance::window_start(as_of)
            .and_hms_opt(0, 0, 0)
            .map(|start| start.and_utc());
        let pool = &self.pool;
        let policy = &self.policy;

        self.cache
            .get_or_fetch(&key, self.ttl, || async move {
                let (fees, payments) = tokio::try_join!(
                    fetch::with_retry(policy, "fees", move || {
                        db::fetch_fees(pool, school_id, academic_year)
                    }),
                    fetch::with_retry(policy, "payments", move || {
                        db::fetch_payments(pool, school_id, since)
                    }),
                )?;
                Ok(finance::build_financial_report(&fees, &payments, as_of))
            })
            .await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.request_timeout())
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")?;

    let external = config
        .cache
        .external
        .then(|| PgCacheStore::new(pool.clone()));
    let app = App {
        pool: pool.clone(),
        policy: RetryPolicy::from_config(&config),
        cache: TieredCache::start(&config.cache, external),
        ttl: config.cache.ttl(),
    };

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let school_id = db::seed(&pool).await?;
            println!("Seed data inserted for school {school_id}.");
        }
        Commands::ImportAttendance { school, csv } => {
            let inserted = db::import_attendance_csv(&pool, school, &csv).await?;
            println!("Inserted {inserted} attendance marks from {}.", csv.display());
        }
        Commands::ImportFees { school, csv } => {
            let inserted = db::import_fees_csv(&pool, school, &csv).await?;
            println!("Inserted {inserted} fees from {}.", csv.display());
        }
        Commands::RecordPayment {
            fee,
            amount,
            method,
            reference,
        } => {
            let method: PaymentMethod = method.parse()?;
            let recorded =
                db::record_payment(&pool, fee, amount, method, reference.as_deref()).await?;
            println!(
                "Payment {} recorded; fee has {:.2} paid ({}).",
                recorded.payment_id,
                recorded.paid_amount,
                recorded.status.as_str()
            );
        }
        Commands::Attendance {
            school,
            window,
            out,
        } => {
            let school_name = db::fetch_school_name(&pool, school).await?;
            let report = app.attendance_report(school, window.range()?).await?;
            let markdown = report::build_attendance_markdown(&school_name, &report);
            emit(markdown, out)?;
        }
        Commands::Finance {
            school,
            academic_year,
            out,
        } => {
            let school_name = db::fetch_school_name(&pool, school).await?;
            let report = app.finance_report(school, academic_year.as_deref()).await?;
            let markdown = report::build_finance_markdown(&school_name, &report);
            emit(markdown, out)?;
        }
        Commands::Competency {
            student,
            academic_year,
            out,
        } => {
            let policy = &app.policy;
            let (name, scores) = tokio::try_join!(
                db::fetch_student_name(&pool, student),
                fetch::with_retry(policy, "strand scores", || {
                    db::fetch_strand_scores(&pool, student, academic_year.as_deref())
                }),
            )?;
            let results = competency::summarize_learning_areas(&scores);
            emit(report::build_competency_markdown(&name, &results), out)?;
        }
        Commands::Report {
            school,
            academic_year,
            window,
            out,
        } => {
            let range = window.range()?;
            let (school_name, attendance, finance) = tokio::try_join!(
                db::fetch_school_name(&pool, school),
                app.attendance_report(school, range),
                app.finance_report(school, academic_year.as_deref()),
            )?;
            let mut markdown = report::build_attendance_markdown(&school_name, &attendance);
            markdown.push('\n');
            markdown.push_str(&report::build_finance_markdown(&school_name, &finance));
            emit(markdown, out)?;
        }
        Commands::Dashboard { school, window } => {
            dashboard(&app, school, window.range()?).await;
        }
        Commands::Export {
            school,
            dataset,
            format,
            out,
            window,
        } => {
            let written = export_dataset(&app, school, dataset, format, &out, window).await?;
            println!("Exported {written} rows to {}.", out.display());
        }
        Commands::Watch {
            school,
            every_secs,
            window,
        } => {
            watch(&app, school, every_secs, window).await?;
        }
    }

    Ok(())
}

fn emit(markdown: String, out: Option<PathBuf>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            std::fs::write(&path, markdown)?;
            println!("Report written to {}.", path.display());
        }
        None => print!("{markdown}"),
    }
    Ok(())
}

async fn dashboard(app: &App, school_id: Uuid, range: DateRange) {
    let pool = &app.pool;
    let (name, attendance, finance) = tokio::join!(
        db::fetch_school_name(pool, school_id),
        app.attendance_report(school_id, range),
        app.finance_report(school_id, None),
    );

    let name = fetch::settled("school", name).unwrap_or_else(|| school_id.to_string());
    println!("# {name}");

    match fetch::settled("attendance", attendance) {
        Some(report) => {
            println!(
                "Attendance {}% over {} learners ({}), trend {}",
                report.summary.overall_attendance_percentage,
                report.summary.unique_students,
                range,
                report.trend
            );
            let chronic: usize = report
                .class_summaries
                .iter()
                .map(|class| class.chronic_absentees)
                .sum();
            println!("Chronic absentees: {chronic}");
        }
        None => println!("Attendance: unavailable"),
    }

    match fetch::settled("finance", finance) {
        Some(report) => {
            println!(
                "Fees collected {:.2} of {:.2} ({:.1}%), outstanding {:.2}",
                report.summary.total_collected,
                report.summary.total_fees,
                report.summary.collection_rate,
                report.summary.outstanding
            );
            for line in report.recommendations.iter().take(2) {
                println!("- {line}");
            }
        }
        None => println!("Finance: unavailable"),
    }
}

async fn export_dataset(
    app: &App,
    school_id: Uuid,
    dataset: Dataset,
    format: ExportFormat,
    out: &std::path::Path,
    window: Window,
) -> anyhow::Result<usize> {
    let range = window.range()?;
    let pool = &app.pool;
    let policy = &app.policy;

    if format == ExportFormat::Csv
        && matches!(dataset, Dataset::AttendanceReport | Dataset::FinanceReport)
    {
        bail!("{dataset:?} is nested; export it as json");
    }

    let written = match dataset {
        Dataset::AttendanceRows => {
            let rows = fetch::with_retry(policy, "attendance", || {
                db::fetch_attendance(pool, school_id, Some(range))
            })
            .await?;
            export::export_rows(out, format, &rows)?
        }
        Dataset::WeeklyTrends => {
            let report = app.attendance_report(school_id, range).await?;
            export::export_rows(out, format, &report.weekly_trends)?
        }
        Dataset::Classes => {
            let report = app.attendance_report(school_id, range).await?;
            export::export_rows(out, format, &report.class_summaries)?
        }
        Dataset::AttendanceReport => {
            let report = app.attendance_report(school_id, range).await?;
            export::write_json(out, &report)?;
            1
        }
        Dataset::Fees => {
            let fees = fetch::with_retry(policy, "fees", || db::fetch_fees(pool, school_id, None))
                .await?;
            export::export_rows(out, format, &fees)?
        }
        Dataset::FeeClasses => {
            let report = app.finance_report(school_id, None).await?;
            export::export_rows(out, format, &report.classes)?
        }
        Dataset::MonthlyCollections => {
            let report = app.finance_report(school_id, None).await?;
            export::export_rows(out, format, &report.monthly)?
        }
        Dataset::PaymentMethods => {
            let report = app.finance_report(school_id, None).await?;
            export::export_rows(out, format, &report.payment_methods)?
        }
        Dataset::FinanceReport => {
            let report = app.finance_report(school_id, None).await?;
            export::write_json(out, &report)?;
            1
        }
    };
    Ok(written)
}

async fn watch(app: &App, school_id: Uuid, every_secs: u64, window: Window) -> anyhow::Result<()> {
    let latest = LatestRequest::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(every_secs.max(1)));
    info!("watching attendance for {school_id} every {}s", every_secs.max(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let range = window.range()?;
                let request_app = app.clone();
                let pending = latest.spawn(async move {
                    request_app.attendance_report(school_id, range).await
                });

                let refresh_app = app.clone();
                app.cache.ensure_refresh(
                    &App::attendance_key(school_id, range),
                    app.ttl,
                    app.ttl.mul_f64(0.8),
                    move || async move { refresh_app.build_attendance(school_id, range).await },
                );

                tokio::spawn(async move {
                    match pending.wait().await {
                        Ok(report) => println!(
                            "{} attendance {}% ({} records, trend {})",
                            Utc::now().format("%H:%M:%S"),
                            report.summary.overall_attendance_percentage,
                            report.summary.total_records,
                            report.trend
                        ),
                        Err(err) if err.kind() == ErrorKind::Cancelled => {
                            debug!("attendance refresh superseded");
                        }
                        Err(err) => warn!("attendance refresh failed: {err}"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("stopping watch");
                break;
            }
        }
    }

    Ok(())
}
