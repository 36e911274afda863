use std::collections::{HashMap, HashSet};

use chrono::{Datelike, NaiveDate};
use uuid::Uuid;

use crate::models::{
    ClassFeeBreakdown, Fee, FinancialReport, FinancialSummary, MonthlyCollection, Payment,
    PaymentMethod, PaymentMethodBreakdown,
};
use crate::report;

pub const MONTH_WINDOW: usize = 6;

/// Collected over billed as a percentage, clamped to [0, 100].
pub fn collection_rate(collected: f64, billed: f64) -> f64 {
    if billed <= 0.0 {
        return 0.0;
    }
    (collected / billed * 100.0).clamp(0.0, 100.0)
}

pub fn calculate_financial_summary(fees: &[Fee]) -> FinancialSummary {
    let total_fees: f64 = fees.iter().map(|fee| fee.amount).sum();
    let total_collected: f64 = fees.iter().map(|fee| fee.paid_amount).sum();
    let students: HashSet<Uuid> = fees.iter().map(|fee| fee.student_id).collect();

    FinancialSummary {
        total_fees,
        total_collected,
        outstanding: (total_fees - total_collected).max(0.0),
        overpaid: (total_collected - total_fees).max(0.0),
        collection_rate: collection_rate(total_collected, total_fees),
        student_count: students.len(),
    }
}

fn month_key(date: NaiveDate) -> (i32, u32) {
    (date.year(), date.month())
}

fn trailing_months(as_of: NaiveDate, count: usize) -> Vec<(i32, u32)> {
    let mut year = as_of.year();
    let mut month = as_of.month();
    let mut months = Vec::with_capacity(count);
    for _ in 0..count {
        months.push((year, month));
        if month == 1 {
            year -= 1;
            month = 12;
        } else {
            month -= 1;
        }
    }
    months.reverse();
    months
}

fn month_label(year: i32, month: u32) -> String {
    const NAMES: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    format!("{} {}", NAMES[(month as usize - 1) % 12], year)
}

/// First day of the earliest month in the trailing window.
pub fn window_start(as_of: NaiveDate) -> NaiveDate {
    let (year, month) = trailing_months(as_of, MONTH_WINDOW)[0];
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(as_of)
}

pub fn calculate_monthly_collections(
    fees: &[Fee],
    payments: &[Payment],
    as_of: NaiveDate,
) -> Vec<MonthlyCollection> {
    let mut expected: HashMap<(i32, u32), f64> = HashMap::new();
    let mut collected: HashMap<(i32, u32), f64> = HashMap::new();

    for fee in fees {
        *expected.entry(month_key(fee.due_date)).or_insert(0.0) += fee.amount;
    }
    for payment in payments {
        *collected
            .entry(month_key(payment.paid_at.date_naive()))
            .or_insert(0.0) += payment.amount;
    }

    trailing_months(as_of, MONTH_WINDOW)
        .into_iter()
        .map(|(year, month)| MonthlyCollection {
            month: format!("{:04}-{:02}", year, month),
            label: month_label(year, month),
            expected: expected.get(&(year, month)).copied().unwrap_or(0.0),
            collected: collected.get(&(year, month)).copied().unwrap_or(0.0),
        })
        .collect()
}

pub fn calculate_payment_methods(payments: &[Payment]) -> Vec<PaymentMethodBreakdown> {
    let mut map: HashMap<PaymentMethod, (f64, usize)> = HashMap::new();

    for payment in payments {
        let entry = map.entry(payment.method).or_insert((0.0, 0));
        entry.0 += payment.amount;
        entry.1 += 1;
    }

    let mut breakdown: Vec<PaymentMethodBreakdown> = map
        .into_iter()
        .map(|(method, (total_amount, count))| PaymentMethodBreakdown {
            method,
            total_amount,
            count,
        })
        .collect();

    breakdown.sort_by(|a, b| {
        b.total_amount
            .partial_cmp(&a.total_amount)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.method.cmp(&b.method))
    });
    breakdown
}

pub fn calculate_class_breakdown(fees: &[Fee]) -> Vec<ClassFeeBreakdown> {
    let mut map: HashMap<Uuid, (String, f64, f64)> = HashMap::new();

    for fee in fees {
        let entry = map
            .entry(fee.class_id)
            .or_insert_with(|| (fee.class_name.clone(), 0.0, 0.0));
        entry.1 += fee.amount;
        entry.2 += fee.paid_amount;
    }

    let mut classes: Vec<ClassFeeBreakdown> = map
        .into_iter()
        .map(|(class_id, (class_name, total_fees, collected))| ClassFeeBreakdown {
            class_id,
            class_name,
            total_fees,
            collected,
            outstanding: (total_fees - collected).max(0.0),
            collection_rate: collection_rate(collected, total_fees),
        })
        .collect();

    classes.sort_by(|a, b| a.class_name.cmp(&b.class_name));
    classes
}

pub fn build_financial_report(
    fees: &[Fee],
    payments: &[Payment],
    as_of: NaiveDate,
) -> FinancialReport {
    let summary = calculate_financial_summary(fees);
    let monthly = calculate_monthly_collections(fees, payments, as_of);
    let payment_methods = calculate_payment_methods(payments);
    let classes = calculate_class_breakdown(fees);
    let recommendations = report::finance_recommendations(&summary, &classes);

    FinancialReport {
        summary,
        monthly,
        payment_methods,
        classes,
        recommendations,
    }
}
