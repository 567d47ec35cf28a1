//! Range checks, empty-row filtering, quality scoring and gap filling for a
//! reconciled batch. Bad values are nulled, scored or filled; never fatal.

use std::collections::BTreeMap;

use energy_core::{CanonicalRow, CanonicalTable, DomainSchema, TimeSeriesRecord};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub input_rows: usize,
    pub kept: usize,
    pub rejected_no_timestamp: usize,
    pub rejected_empty: usize,
    /// Values nulled per column for lying outside the static range.
    pub range_violations: BTreeMap<&'static str, usize>,
    /// Cells filled from a neighbouring row of the same entity.
    pub filled_cells: usize,
}

impl ValidationReport {
    pub fn rejected(&self) -> usize {
        self.rejected_no_timestamp + self.rejected_empty
    }
}

/// Validate one reconciled batch against its domain schema.
///
/// Steps run in a fixed order: drop rows without a timestamp, null
/// out-of-range values, drop rows with no measurement left, score
/// completeness over the required columns, then forward/backward fill
/// within each entity.
pub fn validate_table(
    schema: &'static DomainSchema,
    table: CanonicalTable,
) -> (CanonicalTable, ValidationReport) {
    let CanonicalTable {
        domain,
        rows,
        synthetic,
    } = table;
    let mut report = ValidationReport {
        input_rows: rows.len(),
        ..ValidationReport::default()
    };

    let mut rows: Vec<CanonicalRow> = rows
        .into_iter()
        .filter(|row| {
            let keep = row.timestamp.is_some();
            if !keep {
                report.rejected_no_timestamp += 1;
            }
            keep
        })
        .collect();

    for row in &mut rows {
        for spec in schema.measurements {
            if let Some(value) = row.value(spec.name) {
                if !value.is_finite() || !spec.in_range(value) {
                    row.set(spec.name, None);
                    *report.range_violations.entry(spec.name).or_default() += 1;
                }
            }
        }
    }
    for (column, count) in &report.range_violations {
        warn!(table = schema.table, column, count, "values outside valid range set to null");
    }

    let before = rows.len();
    rows.retain(|row| schema.measurement_names().any(|m| row.value(m).is_some()));
    report.rejected_empty = before - rows.len();
    if report.rejected_empty > 0 {
        warn!(table = schema.table, rows = report.rejected_empty, "dropped rows without any measurement");
    }

    if let Some(quality) = &schema.quality {
        for row in &mut rows {
            row.set(quality.column, Some(quality_score(row, quality.required)));
        }
    }

    report.filled_cells = fill_within_entities(schema, &mut rows);
    report.kept = rows.len();
    debug!(
        table = schema.table,
        input = report.input_rows,
        kept = report.kept,
        filled = report.filled_cells,
        "validated batch"
    );

    (
        CanonicalTable {
            domain,
            rows,
            synthetic,
        },
        report,
    )
}

/// `1 - missing/required`, 1.0 when nothing is required.
pub fn quality_score(row: &CanonicalRow, required: &[&str]) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let missing = required.iter().filter(|c| row.value(c).is_none()).count();
    1.0 - missing as f64 / required.len() as f64
}

/// Forward fill then backward fill every measurement, per entity, in time
/// order. Rows come back sorted by entity then timestamp.
fn fill_within_entities(schema: &DomainSchema, rows: &mut [CanonicalRow]) -> usize {
    rows.sort_by(|a, b| {
        a.entity
            .key_parts()
            .cmp(&b.entity.key_parts())
            .then(a.timestamp.cmp(&b.timestamp))
    });

    let mut filled = 0;
    let mut start = 0;
    while start < rows.len() {
        let mut end = start + 1;
        while end < rows.len() && rows[end].entity == rows[start].entity {
            end += 1;
        }
        let group = &mut rows[start..end];
        for spec in schema.measurements {
            let mut last = None;
            for row in group.iter_mut() {
                match row.value(spec.name) {
                    Some(v) => last = Some(v),
                    None if last.is_some() => {
                        row.set(spec.name, last);
                        filled += 1;
                    }
                    None => {}
                }
            }
            let mut next = None;
            for row in group.iter_mut().rev() {
                match row.value(spec.name) {
                    Some(v) => next = Some(v),
                    None if next.is_some() => {
                        row.set(spec.name, next);
                        filled += 1;
                    }
                    None => {}
                }
            }
        }
        start = end;
    }
    filled
}

/// Typed records for every validated row of the record's domain.
pub fn to_records<R: TimeSeriesRecord>(table: &CanonicalTable) -> Vec<R> {
    table.rows.iter().filter_map(R::from_canonical).collect()
}
