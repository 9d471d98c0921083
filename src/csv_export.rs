//! RFC 4180 CSV rendering for the export endpoints.

/// A record that renders as one CSV row.
pub trait CsvRow {
    const HEADERS: &'static [&'static str];

    fn cells(&self) -> Vec<String>;
}

fn should_neutralize(value: &str) -> bool {
    matches!(value.chars().next(), Some('=' | '+' | '-' | '@'))
}

/// Prefixes cells that a spreadsheet would evaluate as a formula.
pub fn neutralize_formula(value: &str) -> String {
    if should_neutralize(value) {
        format!("'{value}")
    } else {
        value.to_string()
    }
}

pub fn escape(value: &str) -> String {
    let safe = neutralize_formula(value);
    if safe.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", safe.replace('"', "\"\""))
    } else {
        safe
    }
}

fn line<I, S>(cells: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = cells
        .into_iter()
        .map(|cell| escape(cell.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

/// Header row followed by exactly one row per record.
pub fn render<T: CsvRow>(rows: &[T]) -> String {
    let mut csv = line(T::HEADERS);

    for row in rows {
        csv.push_str(&line(row.cells()));
    }

    csv
}
