//! CSV-backed contact store.
//!
//! The [`ContactStore`] owns the enriched output table: it answers which
//! domains are already processed, appends checkpoint rows, and performs the
//! final merged rewrite.
//!
//! **Write rules:**
//! - Only the batch scheduler writes, at checkpoint and collection points.
//! - Full rewrites go through a temp file in the same directory and an atomic
//!   rename, so an interrupted run leaves the previous file intact.
//! - The header is written exactly once per file.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use leadenrich_shared::{LeadEnrichError, Result, Row, Table, columns, notes, row_key};
use tracing::{debug, info, warn};

/// Handle on the enriched output CSV.
pub struct ContactStore {
    path: PathBuf,
    domain_column: String,
}

impl ContactStore {
    /// Create a store for the table at `path`, keyed by `domain_column`.
    pub fn new(path: impl Into<PathBuf>, domain_column: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            domain_column: domain_column.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn domain_column(&self) -> &str {
        &self.domain_column
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Load the output table, or `None` if the file does not exist.
    ///
    /// Rows sharing a key are collapsed (last one wins, kept at the first
    /// one's position). This repairs duplicates left by checkpoint appends of
    /// a run that was interrupted before its final rewrite.
    pub fn load(&self) -> Result<Option<Table>> {
        Ok(self.load_counting_duplicates()?.map(|(table, _)| table))
    }

    /// [`load`](Self::load), plus the number of duplicate rows collapsed.
    /// A non-zero count means the file on disk still holds the duplicates.
    pub fn load_counting_duplicates(&self) -> Result<Option<(Table, usize)>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no existing output table");
            return Ok(None);
        }

        let raw = read_table(&self.path)
            .map_err(|e| LeadEnrichError::output(&self.path, e.to_string()))?;
        let raw_len = raw.len();
        let table = merge_rows(
            Table::with_headers(raw.headers),
            raw.rows,
            &self.domain_column,
        );
        let duplicates = raw_len - table.len();
        if duplicates > 0 {
            info!(
                path = %self.path.display(),
                duplicates,
                "collapsed duplicate rows in output table"
            );
        }
        Ok(Some((table, duplicates)))
    }

    /// Domains that already hold a usable contact and must not be enriched
    /// again. A missing output file yields an empty set.
    pub fn processed_domains(&self) -> Result<HashSet<String>> {
        let Some(table) = self.load()? else {
            return Ok(HashSet::new());
        };
        let processed = processed_in(&table, &self.domain_column);
        info!(
            path = %self.path.display(),
            processed = processed.len(),
            "loaded processed domains"
        );
        Ok(processed)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Checkpoint write: append `rows` under the existing header.
    ///
    /// Creates the file with a header if it is missing or empty. If the rows
    /// introduce columns the file lacks, the whole table is rewritten with the
    /// reconciled header instead (missing cells left empty).
    pub fn append_rows(&self, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let existing_header = self.read_header()?;
        let Some(header) = existing_header.filter(|h| !h.is_empty()) else {
            let mut table = Table::default();
            for row in rows {
                table.push(row.clone());
            }
            write_table_atomic(&self.path, &table)?;
            debug!(path = %self.path.display(), rows = rows.len(), "created output table");
            return Ok(());
        };

        let introduces_columns = rows
            .iter()
            .flat_map(|r| r.columns())
            .any(|c| !header.iter().any(|h| h == c));

        if introduces_columns {
            let mut table = self
                .load()?
                .unwrap_or_else(|| Table::with_headers(header.clone()));
            for row in rows {
                table.push(row.clone());
            }
            write_table_atomic(&self.path, &table)?;
            info!(
                path = %self.path.display(),
                columns = table.headers.len(),
                "reconciled output header during checkpoint"
            );
            return Ok(());
        }

        let layout = Table::with_headers(header);
        let mut buf = Vec::new();
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&mut buf);
            for row in rows {
                writer
                    .write_record(layout.record_for(row))
                    .map_err(|e| LeadEnrichError::output(&self.path, e.to_string()))?;
            }
            writer
                .flush()
                .map_err(|e| LeadEnrichError::io(&self.path, e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LeadEnrichError::io(&self.path, e))?;
        if !ends_with_newline(&mut file).map_err(|e| LeadEnrichError::io(&self.path, e))? {
            buf.insert(0, b'\n');
        }
        // One write per checkpoint so an interruption cannot interleave rows.
        file.write_all(&buf)
            .and_then(|_| file.sync_data())
            .map_err(|e| LeadEnrichError::io(&self.path, e))?;

        debug!(path = %self.path.display(), rows = rows.len(), "appended checkpoint rows");
        Ok(())
    }

    /// Final write: merge `new_rows` over `existing` by row key and rewrite
    /// the whole file atomically. Returns the merged table.
    pub fn rewrite_merged(&self, existing: &Table, new_rows: &[Row]) -> Result<Table> {
        let merged = merge_rows(existing.clone(), new_rows.to_vec(), &self.domain_column);
        write_table_atomic(&self.path, &merged)?;
        info!(
            path = %self.path.display(),
            rows = merged.len(),
            "wrote merged output table"
        );
        Ok(merged)
    }

    fn read_header(&self) -> Result<Option<Vec<String>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| LeadEnrichError::output(&self.path, e.to_string()))?;
        let header = reader
            .headers()
            .map_err(|e| LeadEnrichError::output(&self.path, e.to_string()))?;
        Ok(Some(header.iter().map(str::to_string).collect()))
    }
}

// ---------------------------------------------------------------------------
// Classification & merge
// ---------------------------------------------------------------------------

/// Whether an output row counts as processed: it carries a contact (first
/// name, last name or email) and its note is not the "no contacts" sentinel.
pub fn is_processed(row: &Row) -> bool {
    let has_contact = !row.is_blank(columns::FIRST_NAME)
        || !row.is_blank(columns::LAST_NAME)
        || !row.is_blank(columns::EMAIL);
    has_contact && row.get(columns::ENRICHMENT_NOTE).trim() != notes::NO_CONTACTS_FOUND
}

/// Processed domain keys in `table`. Falls back to the `company_domain`
/// column for rows whose domain cell is blank.
pub fn processed_in(table: &Table, domain_column: &str) -> HashSet<String> {
    table
        .rows
        .iter()
        .filter(|row| is_processed(row))
        .filter_map(|row| {
            let domain = match row.get(domain_column).trim() {
                "" => row.get(columns::COMPANY_DOMAIN).trim(),
                d => d,
            };
            (!domain.is_empty()).then(|| domain.to_string())
        })
        .collect()
}

/// Merge `new_rows` into `base` by [`row_key`]: a row whose key is already
/// present replaces the earlier row in place, others are appended.
pub fn merge_rows(mut base: Table, new_rows: Vec<Row>, domain_column: &str) -> Table {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<Row> = Vec::with_capacity(base.rows.len() + new_rows.len());

    for row in std::mem::take(&mut base.rows).into_iter().chain(new_rows) {
        let key = row_key(&row, domain_column);
        match positions.get(&key) {
            Some(&idx) => {
                for column in row.columns() {
                    base.ensure_column(column);
                }
                rows[idx] = row;
            }
            None => {
                positions.insert(key, rows.len());
                for column in row.columns() {
                    base.ensure_column(column);
                }
                rows.push(row);
            }
        }
    }

    base.rows = rows;
    base
}

// ---------------------------------------------------------------------------
// CSV I/O
// ---------------------------------------------------------------------------

/// Read a CSV file with a header row into a [`Table`].
///
/// Short records are tolerated (missing cells read as empty); cells beyond
/// the header are dropped.
pub fn read_table(path: &Path) -> Result<Table> {
    let file = std::fs::File::open(path).map_err(|e| LeadEnrichError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut table = Table::with_headers(headers.clone());

    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() > headers.len() {
            warn!(
                path = %path.display(),
                record = line + 1,
                extra = record.len() - headers.len(),
                "record has more cells than the header, extra cells dropped"
            );
        }
        let row = Row::from_pairs(
            headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), record.get(i).unwrap_or("").to_string())),
        );
        table.rows.push(row);
    }

    Ok(table)
}

/// Write `table` to `path` through a temp file and an atomic rename.
pub fn write_table_atomic(path: &Path, table: &Table) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| LeadEnrichError::io(&dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| LeadEnrichError::io(&dir, e))?;
    {
        let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
        writer
            .write_record(&table.headers)
            .map_err(|e| LeadEnrichError::output(path, e.to_string()))?;
        for row in &table.rows {
            writer
                .write_record(table.record_for(row))
                .map_err(|e| LeadEnrichError::output(path, e.to_string()))?;
        }
        writer.flush().map_err(|e| LeadEnrichError::io(path, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| LeadEnrichError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| LeadEnrichError::io(path, e.error))?;
    Ok(())
}

fn ends_with_newline(file: &mut std::fs::File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadenrich_shared::DEFAULT_DOMAIN_COLUMN;

    fn contact_row(domain: &str, email: &str) -> Row {
        Row::from_pairs([
            ("Company", domain.split('.').next().unwrap_or(domain)),
            (DEFAULT_DOMAIN_COLUMN, domain),
            (columns::FIRST_NAME, "Ada"),
            (columns::LAST_NAME, "Lovelace"),
            (columns::EMAIL, email),
            (columns::COMPANY_DOMAIN, domain),
        ])
    }

    fn no_contact_row(domain: &str) -> Row {
        Row::from_pairs([
            ("Company", "Quiet"),
            (DEFAULT_DOMAIN_COLUMN, domain),
            (columns::COMPANY_DOMAIN, domain),
            (columns::ENRICHMENT_NOTE, notes::NO_CONTACTS_FOUND),
        ])
    }

    fn store_in(dir: &tempfile::TempDir) -> ContactStore {
        ContactStore::new(dir.path().join("enriched.csv"), DEFAULT_DOMAIN_COLUMN)
    }

    #[test]
    fn processed_classification() {
        assert!(is_processed(&contact_row("acme.io", "ada@acme.io")));
        assert!(!is_processed(&no_contact_row("quiet.io")));

        let mut contact_with_sentinel = contact_row("odd.io", "x@odd.io");
        contact_with_sentinel.set(columns::ENRICHMENT_NOTE, notes::NO_CONTACTS_FOUND);
        assert!(!is_processed(&contact_with_sentinel));

        let failed = Row::from_pairs([
            (DEFAULT_DOMAIN_COLUMN, "down.io"),
            (columns::ENRICHMENT_ERROR, "enrichment timed out after 120s"),
        ]);
        assert!(!is_processed(&failed));
    }

    #[test]
    fn missing_file_means_nothing_processed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.load().unwrap().is_none());
        assert!(store.processed_domains().unwrap().is_empty());
    }

    #[test]
    fn append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.append_rows(&[contact_row("a.io", "ada@a.io")]).unwrap();
        store.append_rows(&[contact_row("b.io", "ada@b.io")]).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        let header_lines = text
            .lines()
            .filter(|l| l.contains(DEFAULT_DOMAIN_COLUMN))
            .count();
        assert_eq!(header_lines, 1);

        let processed = store.processed_domains().unwrap();
        assert!(processed.contains("a.io"));
        assert!(processed.contains("b.io"));
    }

    #[test]
    fn append_reconciles_new_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.append_rows(&[no_contact_row("quiet.io")]).unwrap();
        let mut with_title = contact_row("acme.io", "ada@acme.io");
        with_title.set("Title", "CTO");
        store.append_rows(&[with_title]).unwrap();

        let table = store.load().unwrap().unwrap();
        assert!(table.has_column("Title"));
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0].get("Title"), "");
        assert_eq!(table.rows[1].get("Title"), "CTO");
    }

    #[test]
    fn append_after_file_without_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(
            store.path(),
            format!("Company,{DEFAULT_DOMAIN_COLUMN}\nAcme,acme.io"),
        )
        .unwrap();

        let row = Row::from_pairs([("Company", "Beta"), (DEFAULT_DOMAIN_COLUMN, "beta.io")]);
        store.append_rows(&[row]).unwrap();

        let table = store.load().unwrap().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[1].get(DEFAULT_DOMAIN_COLUMN), "beta.io");
    }

    #[test]
    fn load_collapses_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.append_rows(&[no_contact_row("acme.io")]).unwrap();
        store.append_rows(&[contact_row("acme.io", "ada@acme.io")]).unwrap();

        let (table, duplicates) = store.load_counting_duplicates().unwrap().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(duplicates, 1);
        assert_eq!(table.rows[0].get(columns::EMAIL), "ada@acme.io");

        // Loading alone does not touch the file.
        assert_eq!(read_table(store.path()).unwrap().len(), 2);
    }

    #[test]
    fn rewrite_merged_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let rows = vec![contact_row("a.io", "ada@a.io"), no_contact_row("b.io")];
        let first = store.rewrite_merged(&Table::default(), &rows).unwrap();
        assert_eq!(first.len(), 2);

        let existing = store.load().unwrap().unwrap();
        let retried = vec![contact_row("b.io", "ada@b.io")];
        let second = store.rewrite_merged(&existing, &retried).unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second.rows[1].get(columns::EMAIL), "ada@b.io");

        let again = store.rewrite_merged(&second, &retried).unwrap();
        assert_eq!(again, second);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "enriched.csv")
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind");
    }

    #[test]
    fn merge_keeps_blank_domain_rows_distinct() {
        let a = Row::from_pairs([("Company", "Nameless"), (DEFAULT_DOMAIN_COLUMN, "")]);
        let b = Row::from_pairs([("Company", "Anonymous"), (DEFAULT_DOMAIN_COLUMN, "")]);
        let merged = merge_rows(
            Table::default(),
            vec![a.clone(), b, a],
            DEFAULT_DOMAIN_COLUMN,
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn read_table_tolerates_short_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.csv");
        std::fs::write(&path, "a,b,c\n1,2\n4,5,6\n").unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.headers, vec!["a", "b", "c"]);
        assert_eq!(table.rows[0].get("c"), "");
        assert_eq!(table.rows[1].get("c"), "6");
    }
}
