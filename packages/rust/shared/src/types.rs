//! Tabular data model shared by the store, the worker, and the scheduler.
//!
//! Input and output tables are CSV files with arbitrary columns. A [`Row`]
//! keeps its cells in column order so pass-through columns survive a
//! read/write cycle unchanged.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default header of the column holding the company domain.
pub const DEFAULT_DOMAIN_COLUMN: &str = "Company Domain (website url)";

/// Column names written by the enrichment pipeline.
pub mod columns {
    pub const FIRST_NAME: &str = "First Name";
    pub const LAST_NAME: &str = "Last Name";
    pub const COMPANY_NAME: &str = "Company Name";
    pub const LINKEDIN_URL: &str = "LinkedIn URL";
    pub const EMAIL: &str = "Email";

    pub const COMPANY_DOMAIN: &str = "company_domain";
    pub const ENRICHMENT_ERROR: &str = "enrichment_error";
    pub const ENRICHMENT_NOTE: &str = "enrichment_note";
    pub const ADDITIONAL_CONTACTS_COUNT: &str = "additional_contacts_count";

    /// Columns of a contact record, in the order the collaborator writes them.
    pub const CONTACT: [&str; 5] = [FIRST_NAME, LAST_NAME, COMPANY_NAME, LINKEDIN_URL, EMAIL];

    /// Bookkeeping columns appended after the contact columns.
    pub const BOOKKEEPING: [&str; 4] = [
        COMPANY_DOMAIN,
        ENRICHMENT_ERROR,
        ENRICHMENT_NOTE,
        ADDITIONAL_CONTACTS_COUNT,
    ];

    /// Whether `name` is a column the pipeline itself produces.
    pub fn is_enrichment_column(name: &str) -> bool {
        CONTACT.contains(&name) || BOOKKEEPING.contains(&name)
    }
}

/// Values stored in the `enrichment_note` column.
pub mod notes {
    /// Sentinel for a clean run that produced zero contacts. Rows carrying it
    /// are retried on the next batch.
    pub const NO_CONTACTS_FOUND: &str = "No contacts found by the agent";

    pub const PROCESSING_FAILED: &str = "Agent processing failed, see logs for details";

    pub const ROW_SKIPPED: &str = "Row skipped: no company domain";

    pub fn timed_out(secs: u64) -> String {
        format!("Agent processing timed out after {secs} seconds")
    }

    /// Note for a success that returned more than one candidate.
    pub fn multiple_contacts(total: usize) -> String {
        format!("Found {total} contacts, returning the first one")
    }
}

// ---------------------------------------------------------------------------
// Row
// ---------------------------------------------------------------------------

/// One table row: ordered `(column, value)` cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a row from header/value pairs, keeping their order.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut row = Self::new();
        for (k, v) in pairs {
            row.set(k, v);
        }
        row
    }

    /// Value of `column`, or `""` when the column is absent.
    pub fn get(&self, column: &str) -> &str {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    /// Whether the cell is absent or whitespace-only.
    pub fn is_blank(&self, column: &str) -> bool {
        self.get(column).trim().is_empty()
    }

    /// Set `column` to `value`, replacing an existing cell in place.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(c, _)| *c == column) {
            Some(cell) => cell.1 = value,
            None => self.cells.push((column, value)),
        }
    }

    /// Copy every cell of `other` into this row (later values win).
    pub fn merge(&mut self, other: &Row) {
        for (c, v) in &other.cells {
            self.set(c.clone(), v.clone());
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(c, _)| c.as_str())
    }

    pub fn cells(&self) -> &[(String, String)] {
        &self.cells
    }
}

/// Stable merge key for a row.
///
/// The trimmed domain when present. Rows without a domain are keyed by a
/// SHA-256 fingerprint of their non-empty input cells, so a skipped row is
/// recognised again on the next run instead of being duplicated.
pub fn row_key(row: &Row, domain_column: &str) -> String {
    let domain = row.get(domain_column).trim();
    if !domain.is_empty() {
        return domain.to_string();
    }

    let mut cells: Vec<(&str, &str)> = row
        .cells()
        .iter()
        .filter(|(c, v)| !columns::is_enrichment_column(c) && !v.trim().is_empty())
        .map(|(c, v)| (c.as_str(), v.as_str()))
        .collect();
    cells.sort();

    let mut hasher = Sha256::new();
    for (c, v) in cells {
        hasher.update(c.as_bytes());
        hasher.update([0x1fu8]);
        hasher.update(v.trim().as_bytes());
        hasher.update([0x1eu8]);
    }
    format!("row:{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// A header plus rows. Headers are the union of all row columns in
/// first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn with_headers(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    /// Append `name` to the header if it is not already present.
    pub fn ensure_column(&mut self, name: &str) {
        if !self.has_column(name) {
            self.headers.push(name.to_string());
        }
    }

    /// Push a row, extending the header with any columns it introduces.
    pub fn push(&mut self, row: Row) {
        for column in row.columns() {
            if !self.has_column(column) {
                self.headers.push(column.to_string());
            }
        }
        self.rows.push(row);
    }

    /// Cell values of `row` laid out in header order; missing cells are empty.
    pub fn record_for<'a>(&'a self, row: &'a Row) -> Vec<&'a str> {
        self.headers.iter().map(|h| row.get(h)).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// A contact produced by the enrichment collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub first_name: String,
    pub last_name: String,
    pub company_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkedin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Any further columns the collaborator wrote (e.g. `Title`), in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<(String, String)>,
}

impl Contact {
    /// Interpret a row of the collaborator's `contacts.csv`.
    pub fn from_row(row: &Row) -> Self {
        let optional = |column: &str| {
            let value = row.get(column).trim();
            (!value.is_empty()).then(|| value.to_string())
        };

        Self {
            first_name: row.get(columns::FIRST_NAME).trim().to_string(),
            last_name: row.get(columns::LAST_NAME).trim().to_string(),
            company_name: row.get(columns::COMPANY_NAME).trim().to_string(),
            linkedin_url: optional(columns::LINKEDIN_URL),
            email: optional(columns::EMAIL),
            extra: row
                .cells()
                .iter()
                .filter(|(c, _)| !columns::CONTACT.contains(&c.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Output cells for this contact: the standard columns, then extras.
    pub fn to_row(&self) -> Row {
        let mut row = Row::from_pairs([
            (columns::FIRST_NAME, self.first_name.as_str()),
            (columns::LAST_NAME, self.last_name.as_str()),
            (columns::COMPANY_NAME, self.company_name.as_str()),
            (columns::LINKEDIN_URL, self.linkedin_url.as_deref().unwrap_or("")),
            (columns::EMAIL, self.email.as_deref().unwrap_or("")),
        ]);
        for (c, v) in &self.extra {
            row.set(c.clone(), v.clone());
        }
        row
    }

    /// `"First Last"`, trimmed.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_set_replaces_in_place() {
        let mut row = Row::from_pairs([("a", "1"), ("b", "2")]);
        row.set("a", "3");
        row.set("c", "4");
        let cols: Vec<&str> = row.columns().collect();
        assert_eq!(cols, vec!["a", "b", "c"]);
        assert_eq!(row.get("a"), "3");
        assert_eq!(row.get("missing"), "");
        assert!(row.is_blank("missing"));
    }

    #[test]
    fn table_push_extends_headers() {
        let mut table = Table::with_headers(vec!["Company".into()]);
        table.push(Row::from_pairs([("Company", "Acme"), ("Email", "a@acme.io")]));
        assert_eq!(table.headers, vec!["Company", "Email"]);

        let first = &table.rows[0];
        assert_eq!(table.record_for(first), vec!["Acme", "a@acme.io"]);
    }

    #[test]
    fn row_key_prefers_domain() {
        let row = Row::from_pairs([(DEFAULT_DOMAIN_COLUMN, "  acme.io ")]);
        assert_eq!(row_key(&row, DEFAULT_DOMAIN_COLUMN), "acme.io");
    }

    #[test]
    fn row_key_fingerprint_ignores_enrichment_columns() {
        let input = Row::from_pairs([("Company", "Nameless"), (DEFAULT_DOMAIN_COLUMN, "")]);
        let mut output = input.clone();
        output.set(columns::ENRICHMENT_ERROR, "missing company domain");
        output.set(columns::ENRICHMENT_NOTE, notes::ROW_SKIPPED);

        let key = row_key(&input, DEFAULT_DOMAIN_COLUMN);
        assert!(key.starts_with("row:"));
        assert_eq!(key, row_key(&output, DEFAULT_DOMAIN_COLUMN));

        let other = Row::from_pairs([("Company", "Other")]);
        assert_ne!(key, row_key(&other, DEFAULT_DOMAIN_COLUMN));
    }

    #[test]
    fn contact_from_row_keeps_extra_columns() {
        let row = Row::from_pairs([
            ("First Name", "Carolina"),
            ("Last Name", "Khan"),
            ("Company Name", "Fundraise Up"),
            ("LinkedIn URL", ""),
            ("Email", "carolina@fundraiseup.com"),
            ("Title", "Head of Partnerships"),
        ]);
        let contact = Contact::from_row(&row);
        assert_eq!(contact.display_name(), "Carolina Khan");
        assert!(contact.linkedin_url.is_none());
        assert_eq!(contact.email.as_deref(), Some("carolina@fundraiseup.com"));
        assert_eq!(
            contact.extra,
            vec![("Title".to_string(), "Head of Partnerships".to_string())]
        );

        let out = contact.to_row();
        assert_eq!(out.get("Title"), "Head of Partnerships");
        assert_eq!(out.get(columns::LINKEDIN_URL), "");
    }

    #[test]
    fn multiple_contacts_note() {
        assert_eq!(
            notes::multiple_contacts(3),
            "Found 3 contacts, returning the first one"
        );
    }
}
