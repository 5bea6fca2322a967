//! Writes display rows into a destination table: header upkeep, batched
//! clear/write, column formats and the "last updated" stamp.

use chrono::{DateTime, FixedOffset};
use omsync_core::{Cell, OutputRow};
use omsync_storage::{CellRange, StoreError, TabularStore};
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const CURRENCY_FORMAT: &str = "R$ #,##0.00";
pub const DATE_FORMAT: &str = "dd/MM/yyyy";
pub const SETTINGS_SHEET: &str = "Config";

/// A destination table whose header is in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    pub name: String,
    pub width: usize,
}

/// Number format applied to `cols` columns starting at `col` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnFormat {
    pub col: usize,
    pub cols: usize,
    pub format: &'static str,
}

impl ColumnFormat {
    pub const fn single(col: usize, format: &'static str) -> Self {
        Self { col, cols: 1, format }
    }

    pub const fn span(col: usize, cols: usize, format: &'static str) -> Self {
        Self { col, cols, format }
    }
}

/// Makes sure `name` exists with `header` in row 1.
///
/// The header is only written when row 1 is entirely blank; a populated row 1
/// is left alone even if it differs. Without `preserve`, every row below the
/// header is cleared.
pub async fn ensure_sheet(
    store: &dyn TabularStore,
    name: &str,
    header: &[&str],
    preserve: bool,
) -> Result<TableHandle, StoreError> {
    let width = header.len();
    if !store.has_sheet(name).await? {
        store.create_sheet(name).await?;
        info!(table = name, "destination table created");
    } else if !preserve {
        let last_row = store.last_row(name).await?;
        if last_row > 1 {
            let cols = store.last_column(name).await?.max(width);
            store
                .clear_range(name, CellRange::new(2, 1, last_row - 1, cols))
                .await?;
            debug!(table = name, rows = last_row - 1, "existing body cleared");
        }
    }

    let current = store.read_range(name, CellRange::new(1, 1, 1, width)).await?;
    let header_blank = current
        .first()
        .map_or(true, |row| row.iter().all(Cell::is_blank));
    if header_blank {
        let row: OutputRow = header.iter().map(|h| Cell::text(*h)).collect();
        store.write_range(name, 1, 1, &[row]).await?;
    } else if current
        .first()
        .is_some_and(|row| row.iter().map(Cell::to_string).ne(header.iter().map(|h| h.to_string())))
    {
        warn!(table = name, "header row differs from the expected header; leaving it untouched");
    }

    Ok(TableHandle {
        name: name.to_string(),
        width,
    })
}

/// Clears the first `rows` body rows in batches. Returns the batch count.
pub async fn clear_body(
    store: &dyn TabularStore,
    table: &TableHandle,
    rows: usize,
    batch_size: usize,
) -> Result<usize, StoreError> {
    let batch_size = batch_size.max(1);
    let mut batches = 0;
    let mut start = 0;
    while start < rows {
        let len = batch_size.min(rows - start);
        store
            .clear_range(&table.name, CellRange::new(2 + start, 1, len, table.width))
            .await?;
        batches += 1;
        start += len;
    }
    Ok(batches)
}

/// Writes `rows` from row 2 down in batches. Returns the batch count.
pub async fn write_rows(
    store: &dyn TabularStore,
    table: &TableHandle,
    rows: &[OutputRow],
    batch_size: usize,
) -> Result<usize, StoreError> {
    let batch_size = batch_size.max(1);
    let mut batches = 0;
    for (i, chunk) in rows.chunks(batch_size).enumerate() {
        store
            .write_range(&table.name, 2 + i * batch_size, 1, chunk)
            .await?;
        batches += 1;
    }
    Ok(batches)
}

/// Replaces the whole body: clears what is there, then writes `rows`.
pub async fn replace_body(
    store: &dyn TabularStore,
    table: &TableHandle,
    rows: &[OutputRow],
    batch_size: usize,
) -> Result<(), StoreError> {
    let existing = store.last_row(&table.name).await?.saturating_sub(1);
    let cleared = clear_body(store, table, existing, batch_size).await?;
    let written = write_rows(store, table, rows, batch_size).await?;
    info!(
        table = %table.name,
        cleared_rows = existing,
        cleared_batches = cleared,
        rows = rows.len(),
        batches = written,
        "table body replaced"
    );
    Ok(())
}

/// Applies number formats over the written body and resizes the columns
/// when the table has fewer than `autoresize_below` rows (always when
/// `None`).
pub async fn apply_column_formats(
    store: &dyn TabularStore,
    table: &TableHandle,
    formats: &[ColumnFormat],
    autoresize_below: Option<usize>,
) -> Result<(), StoreError> {
    let last_row = store.last_row(&table.name).await?;
    if last_row <= 1 {
        return Ok(());
    }
    for format in formats {
        store
            .set_number_format(
                &table.name,
                CellRange::new(2, format.col, last_row - 1, format.cols),
                format.format,
            )
            .await?;
    }
    if autoresize_below.map_or(true, |limit| last_row < limit) {
        store.auto_resize_columns(&table.name, 1, table.width).await?;
    } else {
        debug!(table = %table.name, last_row, "table too long; skipping column resize");
    }
    Ok(())
}

/// Parses an A1-style reference such as `G6` into 1-based `(row, col)`.
pub fn parse_a1(reference: &str) -> Option<(usize, usize)> {
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let col = letters
        .chars()
        .try_fold(0usize, |acc, c| {
            let digit = (c.to_ascii_uppercase() as u8).checked_sub(b'A')? as usize + 1;
            acc.checked_mul(26)?.checked_add(digit)
        })?;
    let row: usize = digits.parse().ok()?;
    (row > 0).then_some((row, col))
}

/// Writes `"<label>: dd/mm/yyyy, HH:MM:SS"` into `cell` of the settings
/// sheet. Nothing is written, and `false` returned, when that sheet does not
/// exist or the cell reference is invalid.
pub async fn record_timestamp(
    store: &dyn TabularStore,
    cell: &str,
    label: &str,
    now: DateTime<FixedOffset>,
) -> Result<bool, StoreError> {
    if !store.has_sheet(SETTINGS_SHEET).await? {
        debug!(sheet = SETTINGS_SHEET, "settings sheet missing; timestamp not recorded");
        return Ok(false);
    }
    let Some((row, col)) = parse_a1(cell) else {
        warn!(cell, "invalid timestamp cell reference");
        return Ok(false);
    };
    let stamp = format!("{label}: {}", now.format("%d/%m/%Y, %H:%M:%S"));
    store
        .write_range(SETTINGS_SHEET, row, col, &[vec![Cell::text(stamp)]])
        .await?;
    Ok(true)
}
