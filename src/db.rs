use anyhow::Context;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use log::{debug, info};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::cache::{ExternalStore, StoredEntry};
use crate::competency::{CompetencyLevel, StrandScore};
use crate::error::{DataError, DataResult};
use crate::models::{
    AttendanceRecord, AttendanceStatus, DateRange, Fee, FeeStatus, Payment, PaymentMethod,
};

pub const SEED_SCHOOL_ID: &str = "5b0c6d8e-1f2a-4c3b-9d4e-7a8b9c0d1e2f";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct AttendanceRow {
    student_id: Uuid,
    class_id: Uuid,
    class_name: String,
    date: NaiveDate,
    status: String,
    session: String,
}

impl TryFrom<AttendanceRow> for AttendanceRecord {
    type Error = DataError;

    fn try_from(row: AttendanceRow) -> Result<Self, Self::Error> {
        Ok(AttendanceRecord {
            student_id: row.student_id,
            class_id: row.class_id,
            class_name: row.class_name,
            date: row.date,
            status: row.status.parse()?,
            session: row.session,
        })
    }
}

#[derive(sqlx::FromRow)]
struct FeeRow {
    id: Uuid,
    student_id: Uuid,
    school_id: Uuid,
    class_id: Uuid,
    class_name: String,
    amount: f64,
    paid_amount: f64,
    due_date: NaiveDate,
    term: String,
    academic_year: String,
}

fn checked_amount(field: &str, id: Uuid, value: f64) -> DataResult<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(DataError::validation(format!(
            "{field} of {id} is not a valid amount ({value})"
        )))
    }
}

impl TryFrom<FeeRow> for Fee {
    type Error = DataError;

    fn try_from(row: FeeRow) -> Result<Self, Self::Error> {
        let amount = checked_amount("fee amount", row.id, row.amount)?;
        let paid_amount = checked_amount("paid amount", row.id, row.paid_amount)?;
        Ok(Fee {
            id: row.id,
            student_id: row.student_id,
            school_id: row.school_id,
            class_id: row.class_id,
            class_name: row.class_name,
            amount,
            paid_amount,
            status: FeeStatus::derive(amount, paid_amount),
            due_date: row.due_date,
            term: row.term,
            academic_year: row.academic_year,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    fee_id: Uuid,
    student_id: Uuid,
    school_id: Uuid,
    amount: f64,
    method: String,
    reference: Option<String>,
    paid_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = DataError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let amount = checked_amount("payment amount", row.id, row.amount)?;
        if amount == 0.0 {
            return Err(DataError::validation(format!("payment {} has no amount", row.id)));
        }
        Ok(Payment {
            id: row.id,
            fee_id: row.fee_id,
            student_id: row.student_id,
            school_id: row.school_id,
            amount,
            method: row.method.parse()?,
            reference: row.reference,
            paid_at: row.paid_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StrandRow {
    student_id: Uuid,
    learning_area: String,
    strand: String,
    level: Option<String>,
    term: String,
    academic_year: String,
}

impl TryFrom<StrandRow> for StrandScore {
    type Error = DataError;

    fn try_from(row: StrandRow) -> Result<Self, Self::Error> {
        let level = match row.level.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<CompetencyLevel>()?),
        };
        Ok(StrandScore {
            student_id: row.student_id,
            learning_area: row.learning_area,
            strand: row.strand,
            level,
            term: row.term,
            academic_year: row.academic_year,
        })
    }
}

fn decode_rows<R, T>(rows: Vec<R>) -> DataResult<Vec<T>>
where
    T: TryFrom<R, Error = DataError>,
{
    rows.into_iter().map(T::try_from).collect()
}

pub async fn fetch_school_name(pool: &PgPool, school_id: Uuid) -> DataResult<String> {
    let row = sqlx::query("SELECT name FROM edufam.schools WHERE id = $1")
        .bind(school_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(row.try_get("name")?),
        None => Err(DataError::validation(format!("school {school_id} not found"))),
    }
}

pub async fn fetch_student_name(pool: &PgPool, student_id: Uuid) -> DataResult<String> {
    let row = sqlx::query("SELECT full_name FROM edufam.students WHERE id = $1")
        .bind(student_id)
        .fetch_optional(pool)
        .await?;
    match row {
        Some(row) => Ok(row.try_get("full_name")?),
        None => Err(DataError::validation(format!("student {student_id} not found"))),
    }
}

pub async fn fetch_attendance(
    pool: &PgPool,
    school_id: Uuid,
    range: Option<DateRange>,
) -> DataResult<Vec<AttendanceRecord>> {
    let rows = sqlx::query_as::<_, AttendanceRow>(
        r#"
        SELECT a.student_id, a.class_id, c.name AS class_name, a.date, a.status, a.session
        FROM edufam.attendance a
        JOIN edufam.classes c ON c.id = a.class_id
        WHERE a.school_id = $1
          AND ($2::date IS NULL OR a.date >= $2)
          AND ($3::date IS NULL OR a.date <= $3)
        ORDER BY a.date
        "#,
    )
    .bind(school_id)
    .bind(range.map(|r| r.start))
    .bind(range.map(|r| r.end))
    .fetch_all(pool)
    .await?;

    debug!("fetched {} attendance rows for {school_id}", rows.len());
    decode_rows(rows)
}

pub async fn fetch_fees(
    pool: &PgPool,
    school_id: Uuid,
    academic_year: Option<&str>,
) -> DataResult<Vec<Fee>> {
    let rows = sqlx::query_as::<_, FeeRow>(
        r#"
        SELECT f.id, f.student_id, f.school_id, s.class_id, c.name AS class_name,
               f.amount, f.paid_amount, f.due_date, f.term, f.academic_year
        FROM edufam.fees f
        JOIN edufam.students s ON s.id = f.student_id
        JOIN edufam.classes c ON c.id = s.class_id
        WHERE f.school_id = $1
          AND ($2::text IS NULL OR f.academic_year = $2)
        ORDER BY f.due_date
        "#,
    )
    .bind(school_id)
    .bind(academic_year)
    .fetch_all(pool)
    .await?;

    debug!("fetched {} fee rows for {school_id}", rows.len());
    decode_rows(rows)
}

pub async fn fetch_payments(
    pool: &PgPool,
    school_id: Uuid,
    since: Option<DateTime<Utc>>,
) -> DataResult<Vec<Payment>> {
    let rows = sqlx::query_as::<_, PaymentRow>(
        r#"
        SELECT id, fee_id, student_id, school_id, amount, method, reference, paid_at
        FROM edufam.payments
        WHERE school_id = $1
          AND ($2::timestamptz IS NULL OR paid_at >= $2)
        ORDER BY paid_at
        "#,
    )
    .bind(school_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    debug!("fetched {} payment rows for {school_id}", rows.len());
    decode_rows(rows)
}

pub async fn fetch_strand_scores(
    pool: &PgPool,
    student_id: Uuid,
    academic_year: Option<&str>,
) -> DataResult<Vec<StrandScore>> {
    let rows = sqlx::query_as::<_, StrandRow>(
        r#"
        SELECT student_id, learning_area, strand, level, term, academic_year
        FROM edufam.cbc_strand_scores
        WHERE student_id = $1
          AND ($2::text IS NULL OR academic_year = $2)
        ORDER BY learning_area, strand
        "#,
    )
    .bind(student_id)
    .bind(academic_year)
    .fetch_all(pool)
    .await?;

    decode_rows(rows)
}

#[derive(Debug, Clone)]
pub struct RecordedPayment {
    pub payment_id: Uuid,
    pub paid_amount: f64,
    pub status: FeeStatus,
}

/// Inserts a payment and recomputes the fee's paid amount and status in one
/// transaction.
pub async fn record_payment(
    pool: &PgPool,
    fee_id: Uuid,
    amount: f64,
    method: PaymentMethod,
    reference: Option<&str>,
) -> DataResult<RecordedPayment> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(DataError::validation(format!(
            "payment amount must be positive, got {amount}"
        )));
    }

    let mut tx: Transaction<'_, Postgres> = pool.begin().await?;
    let row = sqlx::query(
        r#"
        SELECT school_id, student_id, amount, paid_amount
        FROM edufam.fees
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(fee_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(row) = row else {
        return Err(DataError::validation(format!("fee {fee_id} not found")));
    };

    let school_id: Uuid = row.try_get("school_id")?;
    let student_id: Uuid = row.try_get("student_id")?;
    let fee_amount = checked_amount("fee amount", fee_id, row.try_get("amount")?)?;
    let already_paid = checked_amount("paid amount", fee_id, row.try_get("paid_amount")?)?;
    let paid_amount = already_paid + amount;
    let status = FeeStatus::derive(fee_amount, paid_amount);

    sqlx::query("UPDATE edufam.fees SET paid_amount = $2, status = $3 WHERE id = $1")
        .bind(fee_id)
        .bind(paid_amount)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;

    let payment_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO edufam.payments
        (id, school_id, fee_id, student_id, amount, method, reference, paid_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        "#,
    )
    .bind(payment_id)
    .bind(school_id)
    .bind(fee_id)
    .bind(student_id)
    .bind(amount)
    .bind(method.as_str())
    .bind(reference)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!("recorded {amount:.2} via {method} against fee {fee_id}; status now {}", status.as_str());

    Ok(RecordedPayment {
        payment_id,
        paid_amount,
        status,
    })
}

/// Cache tier kept in `edufam.cache_entries`.
#[derive(Clone)]
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl ExternalStore for PgCacheStore {
    async fn load(&self, key: &str) -> DataResult<Option<StoredEntry>> {
        let row = sqlx::query("SELECT value, expires_at FROM edufam.cache_entries WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(StoredEntry {
                value: row.try_get::<Value, _>("value")?,
                expires_at: row.try_get("expires_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn store(&self, key: &str, entry: &StoredEntry) -> DataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO edufam.cache_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(&entry.value)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> DataResult<u64> {
        let result = sqlx::query("DELETE FROM edufam.cache_entries WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn upsert_class(pool: &PgPool, school_id: Uuid, name: &str) -> anyhow::Result<Uuid> {
    let class_id: Uuid = sqlx::query(
        r#"
        INSERT INTO edufam.classes (id, school_id, name)
        VALUES ($1, $2, $3)
        ON CONFLICT (school_id, name) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(school_id)
    .bind(name)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(class_id)
}

async fn upsert_student(
    pool: &PgPool,
    school_id: Uuid,
    class_id: Uuid,
    admission_number: &str,
    full_name: &str,
) -> anyhow::Result<Uuid> {
    let student_id: Uuid = sqlx::query(
        r#"
        INSERT INTO edufam.students (id, school_id, class_id, admission_number, full_name)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (school_id, admission_number) DO UPDATE
        SET full_name = EXCLUDED.full_name, class_id = EXCLUDED.class_id
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(school_id)
    .bind(class_id)
    .bind(admission_number)
    .bind(full_name)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(student_id)
}

async fn insert_attendance(
    pool: &PgPool,
    school_id: Uuid,
    student_id: Uuid,
    class_id: Uuid,
    date: NaiveDate,
    status: AttendanceStatus,
    session: &str,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO edufam.attendance (id, school_id, student_id, class_id, date, status, session)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (student_id, date, session) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(school_id)
    .bind(student_id)
    .bind(class_id)
    .bind(date)
    .bind(status.as_str())
    .bind(session)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[allow(clippy::too_many_arguments)]
async fn insert_fee(
    pool: &PgPool,
    school_id: Uuid,
    student_id: Uuid,
    amount: f64,
    paid_amount: f64,
    due_date: NaiveDate,
    term: &str,
    academic_year: &str,
    source_key: &str,
) -> anyhow::Result<Option<Uuid>> {
    let row = sqlx::query(
        r#"
        INSERT INTO edufam.fees
        (id, school_id, student_id, amount, paid_amount, status, due_date, term,
         academic_year, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (source_key) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(school_id)
    .bind(student_id)
    .bind(amount)
    .bind(paid_amount)
    .bind(FeeStatus::derive(amount, paid_amount).as_str())
    .bind(due_date)
    .bind(term)
    .bind(academic_year)
    .bind(source_key)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| row.get("id")))
}

fn seed_status(student_index: usize, day: usize) -> AttendanceStatus {
    // The fifth learner misses every third day so reports show a chronic absentee.
    if student_index == 4 && day % 3 == 0 {
        return AttendanceStatus::Absent;
    }
    match (student_index * 7 + day * 3) % 29 {
        0 | 11 => AttendanceStatus::Absent,
        5 | 19 => AttendanceStatus::Late,
        23 => AttendanceStatus::Excused,
        _ => AttendanceStatus::Present,
    }
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<Uuid> {
    let school_id = Uuid::parse_str(SEED_SCHOOL_ID)?;
    sqlx::query(
        r#"
        INSERT INTO edufam.schools (id, name, code)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
        "#,
    )
    .bind(school_id)
    .bind("Kilimani Junior School")
    .bind("KJS")
    .execute(pool)
    .await?;

    let students = vec![
        ("KJS-001", "Wanjiru Kamau", "Grade 4 East"),
        ("KJS-002", "Brian Otieno", "Grade 4 East"),
        ("KJS-003", "Aisha Mohamed", "Grade 4 East"),
        ("KJS-004", "Kevin Mutua", "Grade 5 West"),
        ("KJS-005", "Faith Chebet", "Grade 5 West"),
        ("KJS-006", "Daniel Kiprop", "Grade 5 West"),
        ("KJS-007", "Mercy Njeri", "Grade 6 North"),
        ("KJS-008", "Samuel Odhiambo", "Grade 6 North"),
        ("KJS-009", "Grace Wambui", "Grade 6 North"),
    ];

    let today = Utc::now().date_naive();
    let first_day = today - Duration::days(42);
    let school_days: Vec<NaiveDate> = first_day
        .iter_days()
        .take_while(|day| *day <= today)
        .filter(|day| !matches!(day.weekday(), Weekday::Sat | Weekday::Sun))
        .collect();
    let due_date = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)
        .context("invalid due date")?;
    let academic_year = today.year().to_string();
    let paid_amounts = [
        15_000.0, 7_500.0, 0.0, 15_000.0, 3_000.0, 12_000.0, 15_000.0, 16_000.0, 5_000.0,
    ];
    let methods = [PaymentMethod::Mpesa, PaymentMethod::Bank, PaymentMethod::Cash];

    for (index, (admission_number, full_name, class_name)) in students.iter().enumerate() {
        let class_id = upsert_class(pool, school_id, class_name).await?;
        let student_id =
            upsert_student(pool, school_id, class_id, admission_number, full_name).await?;

        for (day, date) in school_days.iter().enumerate() {
            insert_attendance(
                pool,
                school_id,
                student_id,
                class_id,
                *date,
                seed_status(index, day),
                "morning",
            )
            .await?;
        }

        let paid = paid_amounts[index % paid_amounts.len()];
        let fee_id = insert_fee(
            pool,
            school_id,
            student_id,
            15_000.0,
            paid,
            due_date,
            "Term 3",
            &academic_year,
            &format!("seed-fee-{admission_number}"),
        )
        .await?;

        if let (Some(fee_id), true) = (fee_id, paid > 0.0) {
            sqlx::query(
                r#"
                INSERT INTO edufam.payments
                (id, school_id, fee_id, student_id, amount, method, reference, paid_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (reference) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(school_id)
            .bind(fee_id)
            .bind(student_id)
            .bind(paid)
            .bind(methods[index % methods.len()].as_str())
            .bind(format!("seed-pay-{admission_number}"))
            .bind(Utc::now() - Duration::days((index as i64) * 11))
            .execute(pool)
            .await?;
        }

        if index < 3 {
            let strands = [
                ("Mathematics", "Numbers"),
                ("Mathematics", "Geometry"),
                ("Mathematics", "Measurement"),
                ("English", "Reading"),
                ("English", "Writing"),
            ];
            let levels = ["proficient", "exceeding", "approaching", "emerging", ""];
            for (offset, (learning_area, strand)) in strands.iter().enumerate() {
                let level = levels[(index + offset) % levels.len()];
                sqlx::query(
                    r#"
                    INSERT INTO edufam.cbc_strand_scores
                    (id, school_id, student_id, learning_area, strand, level, term, academic_year)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (student_id, learning_area, strand, term, academic_year) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(school_id)
                .bind(student_id)
                .bind(*learning_area)
                .bind(*strand)
                .bind((!level.is_empty()).then_some(level))
                .bind("Term 3")
                .bind(&academic_year)
                .execute(pool)
                .await?;
            }
        }
    }

    Ok(school_id)
}

pub async fn import_attendance_csv(
    pool: &PgPool,
    school_id: Uuid,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        admission_number: String,
        full_name: String,
        class_name: String,
        date: NaiveDate,
        status: String,
        session: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result?;
        let status: AttendanceStatus = row
            .status
            .parse()
            .with_context(|| format!("row {} of {}", line + 1, csv_path.display()))?;
        let class_id = upsert_class(pool, school_id, &row.class_name).await?;
        let student_id = upsert_student(
            pool,
            school_id,
            class_id,
            &row.admission_number,
            &row.full_name,
        )
        .await?;
        let session = row
            .session
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("morning");

        if insert_attendance(pool, school_id, student_id, class_id, row.date, status, session)
            .await?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn import_fees_csv(
    pool: &PgPool,
    school_id: Uuid,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        admission_number: String,
        full_name: String,
        class_name: String,
        amount: f64,
        paid_amount: Option<f64>,
        due_date: NaiveDate,
        term: String,
        academic_year: String,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result?;
        let paid_amount = row.paid_amount.unwrap_or(0.0);
        let valid = |value: f64| value.is_finite() && value >= 0.0;
        if !(valid(row.amount) && valid(paid_amount)) {
            anyhow::bail!(
                "row {} of {} has an invalid amount",
                line + 1,
                csv_path.display()
            );
        }
        let class_id = upsert_class(pool, school_id, &row.class_name).await?;
        let student_id = upsert_student(
            pool,
            school_id,
            class_id,
            &row.admission_number,
            &row.full_name,
        )
        .await?;
        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let fee_id = insert_fee(
            pool,
            school_id,
            student_id,
            row.amount,
            paid_amount,
            row.due_date,
            &row.term,
            &row.academic_year,
            &source_key,
        )
        .await?;
        if fee_id.is_some() {
            inserted += 1;
        }
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::TimeZone;

    fn attendance_row(status: &str) -> AttendanceRow {
        AttendanceRow {
            student_id: Uuid::new_v4(),
            class_id: Uuid::new_v4(),
            class_name: "Grade 4 East".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            status: status.to_string(),
            session: "morning".to_string(),
        }
    }

    fn fee_row(amount: f64, paid_amount: f64) -> FeeRow {
        FeeRow {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            school_id: Uuid::new_v4(),
            class_id: Uuid::new_v4(),
            class_name: "Grade 5 West".to_string(),
            amount,
            paid_amount,
            due_date: NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            term: "Term 1".to_string(),
            academic_year: "2026".to_string(),
        }
    }

    fn payment_row(amount: f64, method: &str) -> PaymentRow {
        PaymentRow {
            id: Uuid::new_v4(),
            fee_id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            school_id: Uuid::new_v4(),
            amount,
            method: method.to_string(),
            reference: Some("QKJ4X7Y2".to_string()),
            paid_at: Utc.with_ymd_and_hms(2026, 2, 3, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn attendance_rows_decode_status() {
        let record = AttendanceRecord::try_from(attendance_row("Late")).unwrap();
        assert_eq!(record.status, AttendanceStatus::Late);

        let err = AttendanceRecord::try_from(attendance_row("sick")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn fee_rows_recompute_status() {
        let fee = Fee::try_from(fee_row(10_000.0, 4_000.0)).unwrap();
        assert_eq!(fee.status, FeeStatus::Partial);

        let err = Fee::try_from(fee_row(-5.0, 0.0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = Fee::try_from(fee_row(100.0, f64::NAN)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn payment_rows_require_known_method_and_amount() {
        let payment = Payment::try_from(payment_row(2_500.0, "M-Pesa")).unwrap();
        assert_eq!(payment.method, PaymentMethod::Mpesa);

        assert!(Payment::try_from(payment_row(2_500.0, "cheque")).is_err());
        assert!(Payment::try_from(payment_row(0.0, "cash")).is_err());
    }

    #[test]
    fn strand_rows_treat_blank_levels_as_unscored() {
        let row = StrandRow {
            student_id: Uuid::new_v4(),
            learning_area: "English".to_string(),
            strand: "Writing".to_string(),
            level: Some("  ".to_string()),
            term: "Term 3".to_string(),
            academic_year: "2026".to_string(),
        };
        assert_eq!(StrandScore::try_from(row).unwrap().level, None);
    }

    #[test]
    fn decoding_stops_at_the_first_bad_row() {
        let rows = vec![attendance_row("present"), attendance_row("unknown")];
        let result: DataResult<Vec<AttendanceRecord>> = decode_rows(rows);
        assert!(result.is_err());
    }

    #[test]
    fn seed_pattern_includes_a_chronic_absentee() {
        let absences = (0..30)
            .filter(|day| seed_status(4, *day) == AttendanceStatus::Absent)
            .count();
        assert!(absences as f64 / 30.0 > 0.2);
        assert_eq!(seed_status(0, 1), AttendanceStatus::Present);
    }
}
