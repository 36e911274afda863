use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Excused => "excused",
        }
    }

    /// Late arrivals still count towards the attendance rate.
    pub fn counts_as_attended(&self) -> bool {
        matches!(self, AttendanceStatus::Present | AttendanceStatus::Late)
    }
}

impl FromStr for AttendanceStatus {
    type Err = DataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            "late" => Ok(AttendanceStatus::Late),
            "excused" => Ok(AttendanceStatus::Excused),
            other => Err(DataError::validation(format!(
                "unknown attendance status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: Uuid,
    pub class_id: Uuid,
    pub class_name: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub session: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Window of `days` ending today, never shorter than one day.
    pub fn trailing(days: i64, today: NaiveDate) -> Self {
        Self {
            start: today - Duration::days(days.max(1)),
            end: today,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSummaryData {
    pub total_records: usize,
    pub present_count: usize,
    pub absent_count: usize,
    pub late_count: usize,
    pub excused_count: usize,
    pub overall_attendance_percentage: u32,
    pub unique_students: usize,
    pub unique_dates: usize,
    pub date_range: Option<DateRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekDirection {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyTrend {
    pub week_start: NaiveDate,
    pub week_end: NaiveDate,
    pub attendance_rate: u32,
    pub trend_direction: WeekDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TrendDirection::Improving => "improving",
            TrendDirection::Declining => "declining",
            TrendDirection::Stable => "stable",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassAttendanceSummary {
    pub class_id: Uuid,
    pub class_name: String,
    pub student_count: usize,
    pub attendance_rate: u32,
    pub chronic_absentees: usize,
    pub perfect_attendance: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceReport {
    pub summary: AttendanceSummaryData,
    pub weekly_trends: Vec<WeeklyTrend>,
    pub class_summaries: Vec<ClassAttendanceSummary>,
    pub trend: TrendDirection,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeStatus {
    Pending,
    Partial,
    Paid,
    Overpaid,
}

impl FeeStatus {
    /// Status is always recomputed from the amounts, never read back.
    pub fn derive(amount: f64, paid_amount: f64) -> Self {
        if paid_amount <= 0.0 {
            FeeStatus::Pending
        } else if paid_amount < amount {
            FeeStatus::Partial
        } else if paid_amount > amount {
            FeeStatus::Overpaid
        } else {
            FeeStatus::Paid
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeeStatus::Pending => "pending",
            FeeStatus::Partial => "partial",
            FeeStatus::Paid => "paid",
            FeeStatus::Overpaid => "overpaid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fee {
    pub id: Uuid,
    pub student_id: Uuid,
    pub school_id: Uuid,
    pub class_id: Uuid,
    pub class_name: String,
    pub amount: f64,
    pub paid_amount: f64,
    pub status: FeeStatus,
    pub due_date: NaiveDate,
    pub term: String,
    pub academic_year: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Mpesa,
    Bank,
    Card,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Mpesa => "mpesa",
            PaymentMethod::Bank => "bank",
            PaymentMethod::Card => "card",
            PaymentMethod::Other => "other",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = DataError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "mpesa" | "m-pesa" | "mobile_money" => Ok(PaymentMethod::Mpesa),
            "bank" | "bank_transfer" => Ok(PaymentMethod::Bank),
            "card" => Ok(PaymentMethod::Card),
            "other" => Ok(PaymentMethod::Other),
            other => Err(DataError::validation(format!(
                "unknown payment method '{other}'"
            ))),
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub fee_id: Uuid,
    pub student_id: Uuid,
    pub school_id: Uuid,
    pub amount: f64,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialSummary {
    pub total_fees: f64,
    pub total_collected: f64,
    pub outstanding: f64,
    pub overpaid: f64,
    pub collection_rate: f64,
    pub student_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyCollection {
    pub month: String,
    pub label: String,
    pub expected: f64,
    pub collected: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethodBreakdown {
    pub method: PaymentMethod,
    pub total_amount: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFeeBreakdown {
    pub class_id: Uuid,
    pub class_name: String,
    pub total_fees: f64,
    pub collected: f64,
    pub outstanding: f64,
    pub collection_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialReport {
    pub summary: FinancialSummary,
    pub monthly: Vec<MonthlyCollection>,
    pub payment_methods: Vec<PaymentMethodBreakdown>,
    pub classes: Vec<ClassFeeBreakdown>,
    pub recommendations: Vec<String>,
}
