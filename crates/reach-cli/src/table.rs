//! CSV input rows and result output.

use std::path::Path;

use anyhow::{Context, Result, bail};
use reach_core::models::{Row, RowStatus, RunResult, SOCIAL_PLATFORMS};

/// Column holding the extracted email addresses.
pub const EMAIL_COLUMN: &str = "email";

/// Parsed input file: header order is kept for the output.
#[derive(Debug)]
pub struct InputTable {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

/// Read `path`, taking each row's target from `target_column` (case-insensitive).
pub fn read_rows(path: &Path, target_column: &str) -> Result<InputTable> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open input file: {}", path.display()))?;

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let Some(target_idx) = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(target_column))
    else {
        bail!(
            "Column '{}' not found in {} (columns: {})",
            target_column,
            path.display(),
            headers.join(", ")
        );
    };

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("Malformed CSV record at data row {}", line + 1))?;
        let target = record.get(target_idx).unwrap_or_default().to_string();
        let row = headers
            .iter()
            .zip(record.iter())
            .fold(Row::new(target), |row, (name, value)| {
                row.with_field(name.clone(), value)
            });
        rows.push(row);
    }

    Ok(InputTable { headers, rows })
}

/// Output columns appended after the input columns.
fn result_columns() -> Vec<&'static str> {
    let mut columns = vec![EMAIL_COLUMN];
    columns.extend_from_slice(SOCIAL_PLATFORMS);
    columns.extend_from_slice(&["status", "error"]);
    columns
}

/// Write every input row with its contacts, in input order.
///
/// Input columns that share a name with a result column are replaced.
pub fn write_results(path: &Path, headers: &[String], result: &RunResult) -> Result<()> {
    let result_columns = result_columns();
    let kept: Vec<&String> = headers
        .iter()
        .filter(|h| !result_columns.iter().any(|c| h.eq_ignore_ascii_case(c)))
        .collect();

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;

    let header_row: Vec<&str> = kept
        .iter()
        .map(|h| h.as_str())
        .chain(result_columns.iter().copied())
        .collect();
    writer.write_record(&header_row)?;

    for row_result in &result.rows {
        let mut record: Vec<String> = kept
            .iter()
            .map(|h| row_result.row.fields.get(*h).cloned().unwrap_or_default())
            .collect();

        match &row_result.contacts {
            Some(contacts) => {
                record.push(contacts.emails.join(", "));
                for platform in SOCIAL_PLATFORMS {
                    record.push(contacts.links_for(platform).join(", "));
                }
            }
            None => record.extend(std::iter::repeat_n(String::new(), 1 + SOCIAL_PLATFORMS.len())),
        }

        let (status, error) = match &row_result.status {
            RowStatus::Completed => ("completed", String::new()),
            RowStatus::Failed { message, .. } => ("failed", message.clone()),
            RowStatus::Pending => ("pending", String::new()),
        };
        record.push(status.to_string());
        record.push(error);

        writer.write_record(&record)?;
    }

    writer.flush().context("Failed to flush output file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use reach_core::models::{ContactInfo, RowResult, RunSummary};
    use reach_core::retry::ErrorSummary;
    use uuid::Uuid;

    fn write_input(dir: &Path, content: &str) -> std::path::PathBuf {
        let path = dir.join("businesses.csv");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_read_rows_with_target_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_input(
            dir.path(),
            "name,Website,city\nAcme,https://acme.test,Rome\nNo Site,,Milan\n",
        );

        let table = read_rows(&path, "website").unwrap();
        assert_eq!(table.headers, vec!["name", "Website", "city"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].target, "https://acme.test");
        assert_eq!(table.rows[0].fields["city"], "Rome");
        assert_eq!(table.rows[1].target, "");
    }

    #[test]
    fn test_read_rows_missing_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_input(dir.path(), "name,url\nAcme,https://acme.test\n");

        let err = read_rows(&path, "website").unwrap_err();
        assert!(err.to_string().contains("Column 'website' not found"));
    }

    #[test]
    fn test_write_results_appends_contact_columns() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.csv");

        let mut contacts = ContactInfo {
            emails: vec!["a@acme.test".into(), "b@acme.test".into()],
            ..Default::default()
        };
        contacts.social_links.insert(
            "facebook".into(),
            vec!["https://facebook.com/acme".into()],
        );

        let headers = vec!["name".to_string(), "website".to_string(), "email".to_string()];
        let rows = vec![
            RowResult {
                index: 0,
                row: Row::new("https://acme.test")
                    .with_field("name", "Acme")
                    .with_field("website", "https://acme.test")
                    .with_field("email", "stale@old.test"),
                contacts: Some(contacts),
                status: RowStatus::Completed,
            },
            RowResult {
                index: 1,
                row: Row::new("").with_field("name", "Nowhere"),
                contacts: None,
                status: RowStatus::Failed {
                    kind: "invalid_target".into(),
                    message: "Invalid target: missing target".into(),
                },
            },
        ];
        let result = RunResult {
            rows,
            summary: RunSummary {
                run_id: Uuid::new_v4(),
                job_name: "businesses".into(),
                total: 2,
                completed: 1,
                failed: 1,
                pending: 0,
                dispatched: 1,
                throttle_events: 0,
                interrupted: false,
                elapsed: Duration::from_secs(1),
                most_common_error: None,
            },
            errors: ErrorSummary::default(),
        };

        write_results(&out, &headers, &result).unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(
            lines[0],
            "name,website,email,facebook,instagram,linkedin,x,status,error"
        );
        assert_eq!(
            lines[1],
            "Acme,https://acme.test,\"a@acme.test, b@acme.test\",https://facebook.com/acme,,,,completed,"
        );
        assert_eq!(
            lines[2],
            "Nowhere,,,,,,,failed,Invalid target: missing target"
        );
    }
}
