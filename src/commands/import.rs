//! CSV import.

use crate::commands::Out;
use crate::facade::{DataAccess, ImportItem, ImportOutcome};
use crate::model::{Amount, EntityRef, TransactionDraft, TransactionType};
use crate::{utils, Result};
use anyhow::Context;
use chrono::NaiveDate;
use serde::Deserialize;
use std::fmt::Write;
use std::path::Path;
use std::str::FromStr;

/// One CSV record as written by the user. Parsed field by field so that errors can name the line.
#[derive(Debug, Deserialize)]
struct CsvRow {
    amount: String,
    #[serde(rename = "type")]
    kind: String,
    date: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    recurrence: Option<i64>,
}

impl CsvRow {
    fn into_draft(self) -> Result<TransactionDraft> {
        Ok(TransactionDraft {
            amount: Amount::from_str(&self.amount)?,
            kind: TransactionType::from_str(self.kind.trim().to_lowercase().as_str())
                .with_context(|| format!("Unknown type '{}', use income or expense", self.kind))?,
            date: NaiveDate::from_str(self.date.trim())
                .with_context(|| format!("Invalid date '{}', use YYYY-MM-DD", self.date))?,
            description: self.description.trim().to_string(),
            category: reference(self.category)?,
            source: reference(self.source)?,
            target: reference(self.target)?,
            recurrence: self.recurrence,
        })
    }
}

fn reference(value: Option<String>) -> Result<Option<EntityRef>> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => EntityRef::from_str(s)
            .map(Some)
            .with_context(|| format!("Invalid id '{s}'")),
    }
}

/// Parses the CSV at `path`. A record that cannot be parsed fails the whole file, naming its
/// line; records that parse but break a business rule are reported by the import itself.
pub async fn read_csv(path: &Path) -> Result<Vec<TransactionDraft>> {
    let content = utils::read(path).await?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_reader(content.as_bytes());
    let mut drafts = Vec::new();
    for (i, record) in reader.deserialize::<CsvRow>().enumerate() {
        // Line 1 is the header.
        let line = i + 2;
        let row = record.with_context(|| format!("Unable to read line {line} of the CSV"))?;
        let draft = row
            .into_draft()
            .with_context(|| format!("Line {line} of the CSV is invalid"))?;
        drafts.push(draft);
    }
    Ok(drafts)
}

/// Imports the transactions of a CSV file and reports each record.
pub async fn import_csv(access: &DataAccess, path: &Path) -> Result<Out<ImportOutcome>> {
    let drafts = read_csv(path).await?;
    if drafts.is_empty() {
        return Ok(Out::new("The file has no records", ImportOutcome::default()));
    }
    let outcome = access.import_transactions(drafts).await?;
    let mut message = format!(
        "Imported {} record(s): {} created, {} queued, {} failed",
        outcome.items.len(),
        outcome.created(),
        outcome.queued(),
        outcome.failed()
    );
    for (i, item) in outcome.items.iter().enumerate() {
        if let ImportItem::Failed { error } = item {
            let _ = write!(message, "\n  record {}: {error}", i + 1);
        }
    }
    Ok(Out::new(message, outcome))
}
