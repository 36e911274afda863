use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, Duration, NaiveDate};
use uuid::Uuid;

use crate::models::{
    AttendanceRecord, AttendanceReport, AttendanceStatus, AttendanceSummaryData,
    ClassAttendanceSummary, DateRange, TrendDirection, WeekDirection, WeeklyTrend,
};
use crate::report;

pub const MAX_WEEKS: usize = 8;
pub const TREND_WINDOW: usize = 4;
pub const CHRONIC_ABSENCE_RATIO: f64 = 0.8;
const WEEK_CHANGE_THRESHOLD: i64 = 2;

/// Rounded share of attended records, clamped to [0, 100].
pub fn attendance_rate(attended: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let rate = (attended as f64 / total as f64 * 100.0).round();
    rate.clamp(0.0, 100.0) as u32
}

pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_sunday() as i64)
}

pub fn calculate_attendance_summary(
    rows: &[AttendanceRecord],
    date_range: Option<DateRange>,
) -> AttendanceSummaryData {
    let mut summary = AttendanceSummaryData {
        date_range,
        ..AttendanceSummaryData::default()
    };
    let mut students = HashSet::new();
    let mut dates = HashSet::new();

    for row in rows {
        if let Some(range) = date_range {
            if !range.contains(row.date) {
                continue;
            }
        }

        summary.total_records += 1;
        match row.status {
            AttendanceStatus::Present => summary.present_count += 1,
            AttendanceStatus::Absent => summary.absent_count += 1,
            AttendanceStatus::Late => summary.late_count += 1,
            AttendanceStatus::Excused => summary.excused_count += 1,
        }
        students.insert(row.student_id);
        dates.insert(row.date);
    }

    summary.unique_students = students.len();
    summary.unique_dates = dates.len();
    summary.overall_attendance_percentage = attendance_rate(
        summary.present_count + summary.late_count,
        summary.total_records,
    );
    summary
}

pub fn calculate_weekly_trends(rows: &[AttendanceRecord]) -> Vec<WeeklyTrend> {
    let mut weeks: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();

    for row in rows {
        let entry = weeks.entry(week_start(row.date)).or_insert((0, 0));
        if row.status.counts_as_attended() {
            entry.0 += 1;
        }
        entry.1 += 1;
    }

    let skip = weeks.len().saturating_sub(MAX_WEEKS);
    let mut trends: Vec<WeeklyTrend> = Vec::with_capacity(weeks.len() - skip);
    let mut previous: Option<u32> = None;

    for (start, (attended, total)) in weeks.into_iter().skip(skip) {
        let rate = attendance_rate(attended, total);
        let trend_direction = match previous {
            Some(prior) => {
                let diff = rate as i64 - prior as i64;
                if diff > WEEK_CHANGE_THRESHOLD {
                    WeekDirection::Up
                } else if diff < -WEEK_CHANGE_THRESHOLD {
                    WeekDirection::Down
                } else {
                    WeekDirection::Stable
                }
            }
            None => WeekDirection::Stable,
        };
        trends.push(WeeklyTrend {
            week_start: start,
            week_end: start + Duration::days(6),
            attendance_rate: rate,
            trend_direction,
        });
        previous = Some(rate);
    }

    trends
}

#[derive(Default)]
struct ClassTally {
    class_name: String,
    attended: usize,
    total: usize,
    students: HashMap<Uuid, (usize, usize)>,
}

pub fn calculate_class_summaries(rows: &[AttendanceRecord]) -> Vec<ClassAttendanceSummary> {
    let mut classes: HashMap<Uuid, ClassTally> = HashMap::new();

    for row in rows {
        let tally = classes.entry(row.class_id).or_insert_with(|| ClassTally {
            class_name: row.class_name.clone(),
            ..ClassTally::default()
        });
        let attended = usize::from(row.status.counts_as_attended());
        tally.attended += attended;
        tally.total += 1;
        let student = tally.students.entry(row.student_id).or_insert((0, 0));
        student.0 += attended;
        student.1 += 1;
    }

    let mut summaries: Vec<ClassAttendanceSummary> = classes
        .into_iter()
        .map(|(class_id, tally)| {
            let mut chronic_absentees = 0;
            let mut perfect_attendance = 0;
            for (attended, total) in tally.students.values() {
                if attended == total {
                    perfect_attendance += 1;
                } else if (*attended as f64 / *total as f64) < CHRONIC_ABSENCE_RATIO {
                    chronic_absentees += 1;
                }
            }
            ClassAttendanceSummary {
                class_id,
                class_name: tally.class_name,
                student_count: tally.students.len(),
                attendance_rate: attendance_rate(tally.attended, tally.total),
                chronic_absentees,
                perfect_attendance,
            }
        })
        .collect();

    summaries.sort_by(|a, b| {
        a.class_name
            .cmp(&b.class_name)
            .then_with(|| a.class_id.cmp(&b.class_id))
    });
    summaries
}

pub fn calculate_trend_direction(weekly_trends: &[WeeklyTrend]) -> TrendDirection {
    let recent = &weekly_trends[weekly_trends.len().saturating_sub(TREND_WINDOW)..];
    let ups = recent
        .iter()
        .filter(|week| week.trend_direction == WeekDirection::Up)
        .count() as i64;
    let downs = recent
        .iter()
        .filter(|week| week.trend_direction == WeekDirection::Down)
        .count() as i64;

    if ups - downs > 1 {
        TrendDirection::Improving
    } else if downs - ups > 1 {
        TrendDirection::Declining
    } else {
        TrendDirection::Stable
    }
}

pub fn build_attendance_report(
    rows: &[AttendanceRecord],
    date_range: Option<DateRange>,
) -> AttendanceReport {
    let in_range: Vec<AttendanceRecord> = match date_range {
        Some(range) => rows
            .iter()
            .filter(|row| range.contains(row.date))
            .cloned()
            .collect(),
        None => rows.to_vec(),
    };

    let summary = calculate_attendance_summary(&in_range, date_range);
    let weekly_trends = calculate_weekly_trends(&in_range);
    let class_summaries = calculate_class_summaries(&in_range);
    let trend = calculate_trend_direction(&weekly_trends);
    let recommendations = report::attendance_recommendations(&summary, trend, &class_summaries);

    AttendanceReport {
        summary,
        weekly_trends,
        class_summaries,
        trend,
        recommendations,
    }
}
