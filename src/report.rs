use std::fmt::Write;

use crate::competency::LearningAreaResult;
use crate::models::{
    AttendanceReport, AttendanceSummaryData, ClassAttendanceSummary, ClassFeeBreakdown,
    FinancialReport, FinancialSummary, TrendDirection,
};

const URGENT_ATTENDANCE: u32 = 80;
const WATCH_ATTENDANCE: u32 = 90;
const STRONG_ATTENDANCE: u32 = 95;
const URGENT_COLLECTION: f64 = 50.0;
const WATCH_COLLECTION: f64 = 80.0;

pub fn attendance_recommendations(
    summary: &AttendanceSummaryData,
    trend: TrendDirection,
    classes: &[ClassAttendanceSummary],
) -> Vec<String> {
    let mut lines = Vec::new();

    if summary.total_records == 0 {
        lines.push("No attendance has been recorded for this window yet.".to_string());
        return lines;
    }

    let rate = summary.overall_attendance_percentage;
    if rate < URGENT_ATTENDANCE {
        lines.push(format!(
            "Overall attendance is {rate}%, below the {URGENT_ATTENDANCE}% threshold. \
             Schedule parent meetings for frequently absent learners."
        ));
    } else if rate < WATCH_ATTENDANCE {
        lines.push(format!(
            "Overall attendance is {rate}%. Send attendance reminders to parents \
             to bring it above {WATCH_ATTENDANCE}%."
        ));
    } else if rate >= STRONG_ATTENDANCE {
        lines.push(format!(
            "Overall attendance is {rate}%. Recognise classes and learners with strong attendance."
        ));
    }

    if trend == TrendDirection::Declining {
        lines.push(
            "Attendance has declined over recent weeks. Review timetable or \
             transport changes that may be affecting learners."
                .to_string(),
        );
    }

    for class in classes.iter().filter(|class| class.chronic_absentees > 0) {
        lines.push(format!(
            "{} has {} chronically absent learner(s); assign the class teacher to follow up.",
            class.class_name, class.chronic_absentees
        ));
    }

    if lines.is_empty() {
        lines.push("Attendance is steady; no action needed.".to_string());
    }
    lines
}

pub fn finance_recommendations(
    summary: &FinancialSummary,
    classes: &[ClassFeeBreakdown],
) -> Vec<String> {
    let mut lines = Vec::new();

    if summary.total_fees <= 0.0 {
        lines.push("No fees have been billed for this window.".to_string());
        return lines;
    }

    if summary.collection_rate < URGENT_COLLECTION {
        lines.push(format!(
            "Only {:.1}% of fees have been collected. Escalate fee follow-ups with parents.",
            summary.collection_rate
        ));
    } else if summary.collection_rate < WATCH_COLLECTION {
        lines.push(format!(
            "Collection rate is {:.1}%. Send balance reminders before the next due date.",
            summary.collection_rate
        ));
    }

    let largest = classes
        .iter()
        .filter(|class| class.outstanding > 0.0)
        .max_by(|a, b| {
            a.outstanding
                .partial_cmp(&b.outstanding)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    if let Some(class) = largest {
        lines.push(format!(
            "{} carries the largest outstanding balance ({:.2}).",
            class.class_name, class.outstanding
        ));
    }

    if summary.overpaid > 0.0 {
        lines.push(format!(
            "{:.2} has been paid in excess of billed fees; reconcile credits.",
            summary.overpaid
        ));
    }

    if lines.is_empty() {
        lines.push("Fee collection is on track.".to_string());
    }
    lines
}

pub fn build_attendance_markdown(school_label: &str, report: &AttendanceReport) -> String {
    let mut output = String::new();
    let summary = &report.summary;

    let _ = writeln!(output, "# Attendance Report");
    match summary.date_range {
        Some(range) => {
            let _ = writeln!(output, "Generated for {} ({})", school_label, range);
        }
        None => {
            let _ = writeln!(output, "Generated for {} (all recorded dates)", school_label);
        }
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(
        output,
        "- Overall attendance: {}% across {} records",
        summary.overall_attendance_percentage, summary.total_records
    );
    let _ = writeln!(
        output,
        "- Present {}, late {}, absent {}, excused {}",
        summary.present_count, summary.late_count, summary.absent_count, summary.excused_count
    );
    let _ = writeln!(
        output,
        "- {} learners over {} school days",
        summary.unique_students, summary.unique_dates
    );
    let _ = writeln!(output, "- Trend: {}", report.trend);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Trend");
    if report.weekly_trends.is_empty() {
        let _ = writeln!(output, "No attendance recorded for this window.");
    } else {
        for week in report.weekly_trends.iter() {
            let _ = writeln!(
                output,
                "- {} to {}: {}% ({:?})",
                week.week_start, week.week_end, week.attendance_rate, week.trend_direction
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Classes");
    if report.class_summaries.is_empty() {
        let _ = writeln!(output, "No classes with attendance in this window.");
    } else {
        for class in report.class_summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {}% across {} learners ({} chronic, {} perfect)",
                class.class_name,
                class.attendance_rate,
                class.student_count,
                class.chronic_absentees,
                class.perfect_attendance
            );
        }
    }

    write_recommendations(&mut output, &report.recommendations);
    output
}

pub fn build_finance_markdown(school_label: &str, report: &FinancialReport) -> String {
    let mut output = String::new();
    let summary = &report.summary;

    let _ = writeln!(output, "# Fee Collection Report");
    let _ = writeln!(output, "Generated for {}", school_label);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary (all billed fees)");
    let _ = writeln!(output, "- Billed: {:.2}", summary.total_fees);
    let _ = writeln!(output, "- Collected: {:.2}", summary.total_collected);
    let _ = writeln!(output, "- Outstanding: {:.2}", summary.outstanding);
    let _ = writeln!(output, "- Collection rate: {:.1}%", summary.collection_rate);
    let _ = writeln!(output, "- Learners billed: {}", summary.student_count);

    let window = match (report.monthly.first(), report.monthly.last()) {
        (Some(first), Some(last)) => format!(" ({} to {})", first.label, last.label),
        _ => String::new(),
    };

    let _ = writeln!(output);
    let _ = writeln!(output, "## Monthly Collections{}", window);
    for month in report.monthly.iter() {
        let _ = writeln!(
            output,
            "- {}: expected {:.2}, collected {:.2}",
            month.label, month.expected, month.collected
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Payment Methods{}", window);
    if report.payment_methods.is_empty() {
        let _ = writeln!(output, "No payments recorded in this window.");
    } else {
        for method in report.payment_methods.iter() {
            let _ = writeln!(
                output,
                "- {}: {:.2} across {} payments",
                method.method, method.total_amount, method.count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Classes");
    if report.classes.is_empty() {
        let _ = writeln!(output, "No fees billed.");
    } else {
        for class in report.classes.iter() {
            let _ = writeln!(
                output,
                "- {}: billed {:.2}, collected {:.2}, outstanding {:.2} ({:.1}%)",
                class.class_name,
                class.total_fees,
                class.collected,
                class.outstanding,
                class.collection_rate
            );
        }
    }

    write_recommendations(&mut output, &report.recommendations);
    output
}

pub fn build_competency_markdown(student_label: &str, results: &[LearningAreaResult]) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "# Competency Summary");
    let _ = writeln!(output, "Generated for {}", student_label);
    let _ = writeln!(output);

    if results.is_empty() {
        let _ = writeln!(output, "No strand assessments recorded.");
        return output;
    }

    let mut assessment: Option<(&str, &str)> = None;
    for result in results {
        let current = (result.academic_year.as_str(), result.term.as_str());
        if assessment != Some(current) {
            if assessment.is_some() {
                let _ = writeln!(output);
            }
            let _ = writeln!(output, "## {} {}", result.term, result.academic_year);
            assessment = Some(current);
        }
        match (result.overall, result.average) {
            (Some(level), Some(average)) => {
                let _ = writeln!(
                    output,
                    "- {}: {} (average {:.2} over {} strands)",
                    result.learning_area, level, average, result.assessed_strands
                );
            }
            _ => {
                let _ = writeln!(output, "- {}: not yet assessed", result.learning_area);
            }
        }
    }
    output
}

fn write_recommendations(output: &mut String, recommendations: &[String]) {
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recommendations");
    for line in recommendations {
        let _ = writeln!(output, "- {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn summary(rate: u32) -> AttendanceSummaryData {
        AttendanceSummaryData {
            total_records: 100,
            present_count: rate as usize,
            absent_count: 100 - rate as usize,
            overall_attendance_percentage: rate,
            unique_students: 10,
            unique_dates: 10,
            ..AttendanceSummaryData::default()
        }
    }

    fn class(name: &str, chronic: usize) -> ClassAttendanceSummary {
        ClassAttendanceSummary {
            class_id: Uuid::new_v4(),
            class_name: name.to_string(),
            student_count: 20,
            attendance_rate: 85,
            chronic_absentees: chronic,
            perfect_attendance: 0,
        }
    }

    #[test]
    fn low_attendance_is_urgent() {
        let lines = attendance_recommendations(&summary(72), TrendDirection::Stable, &[]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("72%"));
        assert!(lines[0].contains("parent meetings"));
    }

    #[test]
    fn declining_trend_and_chronic_classes_are_flagged() {
        let classes = vec![class("Grade 4", 2), class("Grade 5", 0)];
        let lines = attendance_recommendations(&summary(92), TrendDirection::Declining, &classes);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("declined"));
        assert!(lines[1].starts_with("Grade 4 has 2"));
    }

    #[test]
    fn healthy_attendance_gets_a_steady_note() {
        let lines = attendance_recommendations(&summary(93), TrendDirection::Stable, &[]);
        assert_eq!(lines, vec!["Attendance is steady; no action needed.".to_string()]);
    }

    #[test]
    fn finance_recommendations_point_at_largest_balance() {
        let summary = FinancialSummary {
            total_fees: 3000.0,
            total_collected: 1200.0,
            outstanding: 1800.0,
            overpaid: 0.0,
            collection_rate: 40.0,
            student_count: 3,
        };
        let classes = vec![
            ClassFeeBreakdown {
                class_id: Uuid::new_v4(),
                class_name: "Grade 1".to_string(),
                total_fees: 1000.0,
                collected: 800.0,
                outstanding: 200.0,
                collection_rate: 80.0,
            },
            ClassFeeBreakdown {
                class_id: Uuid::new_v4(),
                class_name: "Grade 3".to_string(),
                total_fees: 2000.0,
                collected: 400.0,
                outstanding: 1600.0,
                collection_rate: 20.0,
            },
        ];
        let lines = finance_recommendations(&summary, &classes);
        assert!(lines[0].contains("40.0%"));
        assert!(lines[1].starts_with("Grade 3"));
    }

    #[test]
    fn competency_markdown_lists_areas_per_term() {
        let result = |term: &str, level, average| LearningAreaResult {
            academic_year: "2026".to_string(),
            term: term.to_string(),
            learning_area: "Mathematics".to_string(),
            assessed_strands: 2,
            average: Some(average),
            overall: Some(level),
        };
        let results = vec![
            result("Term 1", crate::competency::CompetencyLevel::Approaching, 2.0),
            result("Term 3", crate::competency::CompetencyLevel::Exceeding, 3.5),
        ];
        let output = build_competency_markdown("Wanjiru Kamau", &results);
        let term_one = output.find("## Term 1 2026").unwrap();
        let term_three = output.find("## Term 3 2026").unwrap();
        assert!(term_one < term_three);
        assert!(output.contains("- Mathematics: approaching (average 2.00 over 2 strands)"));
        assert!(output.contains("- Mathematics: exceeding (average 3.50 over 2 strands)"));
    }

    #[test]
    fn finance_markdown_labels_the_payment_window() {
        use crate::finance::build_financial_report;
        use crate::models::{Fee, FeeStatus};
        use chrono::NaiveDate;

        let fee = Fee {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            school_id: Uuid::nil(),
            class_id: Uuid::new_v4(),
            class_name: "Grade 5".to_string(),
            amount: 15_000.0,
            paid_amount: 15_000.0,
            status: FeeStatus::Paid,
            due_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            term: "Term 1".to_string(),
            academic_year: "2025".to_string(),
        };
        let as_of = NaiveDate::from_ymd_opt(2025, 9, 15).unwrap();
        let report = build_financial_report(&[fee], &[], as_of);
        let output = build_finance_markdown("Kilimani Junior School", &report);

        assert!(output.contains("## Summary (all billed fees)"));
        assert!(output.contains("- Collected: 15000.00"));
        assert!(output.contains("## Monthly Collections (Apr 2025 to Sep 2025)"));
        assert!(output.contains("## Payment Methods (Apr 2025 to Sep 2025)"));
        assert!(output.contains("No payments recorded in this window."));
    }
}
