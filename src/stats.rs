use crate::ledger::Status;
use chrono::NaiveDate;
use std::collections::HashMap;

/// Pure aggregation over ledger rows. Handlers fetch the rows (one snapshot
/// per call) and the math here stays testable without a live store.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailySnapshot {
    pub present: i64,
    pub absent: i64,
    pub total: i64,
    pub percentage: f64,
}

/// Per-day roll-up across a teacher's courses. `enrolled_total` is the count
/// of distinct enrolled students, which is the percentage denominator: an
/// unmarked student is neither present nor absent but still dilutes the rate.
pub fn daily_snapshot(marks: &[Status], enrolled_total: i64) -> DailySnapshot {
    let mut present: i64 = 0;
    let mut absent: i64 = 0;
    for s in marks {
        match s {
            Status::Present => present += 1,
            Status::Absent => absent += 1,
            // Late marks sit in neither bucket; they count only toward the
            // raw mark totals used elsewhere.
            Status::Late => {}
        }
    }
    DailySnapshot {
        present,
        absent,
        total: enrolled_total,
        percentage: percentage(present, enrolled_total),
    }
}

pub fn percentage(numerator: i64, denominator: i64) -> f64 {
    if denominator <= 0 {
        0.0
    } else {
        (numerator as f64) / (denominator as f64) * 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub present: i64,
    pub absent: i64,
}

/// Pivot (date, status) rows into an ascending per-day series covering
/// `[start, end]` inclusive. Days with no rows are emitted zero-filled, so
/// the series length is always `end - start + 1`; a window is either complete
/// or the caller returned an error before getting here.
pub fn pivot_trend(rows: &[(NaiveDate, Status)], start: NaiveDate, end: NaiveDate) -> Vec<TrendPoint> {
    let mut by_date: HashMap<NaiveDate, (i64, i64)> = HashMap::new();
    for (date, status) in rows {
        let entry = by_date.entry(*date).or_insert((0, 0));
        match status {
            Status::Present => entry.0 += 1,
            Status::Absent => entry.1 += 1,
            Status::Late => {}
        }
    }

    let mut series = Vec::new();
    let mut day = start;
    while day <= end {
        let (present, absent) = by_date.get(&day).copied().unwrap_or((0, 0));
        series.push(TrendPoint {
            date: day,
            present,
            absent,
        });
        let Some(next) = day.succ_opt() else { break };
        day = next;
    }
    series
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseBreakdownRow {
    pub course_id: String,
    pub name: String,
    pub code: String,
    pub total_students: i64,
    pub present_count: i64,
    pub absent_count: i64,
    pub percentage: f64,
}

/// Per-course roll-up. The percentage denominator here is marked records
/// (present + absent + late), not enrollment: across many days an enrollment
/// count is not a meaningful opportunity count.
pub fn course_breakdown_row(
    course_id: String,
    name: String,
    code: String,
    total_students: i64,
    marks: &[Status],
) -> CourseBreakdownRow {
    let mut present: i64 = 0;
    let mut absent: i64 = 0;
    for s in marks {
        match s {
            Status::Present => present += 1,
            Status::Absent => absent += 1,
            Status::Late => {}
        }
    }
    let marked = marks.len() as i64;
    CourseBreakdownRow {
        course_id,
        name,
        code,
        total_students,
        present_count: present,
        absent_count: absent,
        percentage: percentage(present, marked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("test date")
    }

    #[test]
    fn snapshot_counts_unmarked_students_in_the_denominator() {
        // 10 enrolled, 6 present, 2 absent, 2 unmarked.
        let mut marks = vec![Status::Present; 6];
        marks.extend(vec![Status::Absent; 2]);
        let snap = daily_snapshot(&marks, 10);
        assert_eq!(snap.present, 6);
        assert_eq!(snap.absent, 2);
        assert_eq!(snap.total, 10);
        assert!((snap.percentage - 60.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_with_zero_enrollment_reports_zero_percentage() {
        let snap = daily_snapshot(&[], 0);
        assert_eq!(snap.total, 0);
        assert_eq!(snap.percentage, 0.0);
    }

    #[test]
    fn snapshot_late_marks_fall_in_neither_bucket() {
        let snap = daily_snapshot(&[Status::Present, Status::Late, Status::Late], 3);
        assert_eq!(snap.present, 1);
        assert_eq!(snap.absent, 0);
    }

    #[test]
    fn trend_window_is_inclusive_ascending_and_zero_filled() {
        let rows = vec![
            (d("2024-05-03"), Status::Present),
            (d("2024-05-03"), Status::Absent),
            (d("2024-05-08"), Status::Present),
            (d("2024-05-08"), Status::Late),
        ];
        let series = pivot_trend(&rows, d("2024-05-01"), d("2024-05-08"));
        assert_eq!(series.len(), 8);
        for window in series.windows(2) {
            assert!(window[0].date < window[1].date);
        }
        assert_eq!(series[0].present, 0);
        assert_eq!(series[0].absent, 0);
        assert_eq!(series[2].date, d("2024-05-03"));
        assert_eq!(series[2].present, 1);
        assert_eq!(series[2].absent, 1);
        // Late on the 8th appears in neither field.
        assert_eq!(series[7].present, 1);
        assert_eq!(series[7].absent, 0);
    }

    #[test]
    fn trend_ignores_rows_outside_the_window() {
        let rows = vec![
            (d("2024-04-30"), Status::Present),
            (d("2024-05-02"), Status::Present),
        ];
        let series = pivot_trend(&rows, d("2024-05-01"), d("2024-05-03"));
        assert_eq!(series.len(), 3);
        assert_eq!(series.iter().map(|p| p.present).sum::<i64>(), 1);
    }

    #[test]
    fn breakdown_percentage_uses_marked_records_as_denominator() {
        let marks = vec![
            Status::Present,
            Status::Present,
            Status::Present,
            Status::Absent,
            Status::Late,
        ];
        let row = course_breakdown_row(
            "c1".to_string(),
            "Algebra".to_string(),
            "MATH-101".to_string(),
            25,
            &marks,
        );
        assert_eq!(row.present_count, 3);
        assert_eq!(row.absent_count, 1);
        assert_eq!(row.total_students, 25);
        assert!((row.percentage - 60.0).abs() < 1e-9);
    }

    #[test]
    fn breakdown_with_no_marks_reports_zero_percentage() {
        let row = course_breakdown_row(
            "c1".to_string(),
            "Algebra".to_string(),
            "MATH-101".to_string(),
            25,
            &[],
        );
        assert_eq!(row.percentage, 0.0);
    }
}
