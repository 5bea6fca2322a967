//! Tabular destination: named sheets holding grids of cells.
//!
//! [`TabularStore`] mirrors the handful of spreadsheet operations the sync
//! jobs need (1-based rows and columns, like the spreadsheet UI). [`Workbook`]
//! implements it in memory and, when opened from a path, persists the whole
//! workbook as JSON on [`TabularStore::flush`] through a temp file and an
//! atomic rename.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use omsync_core::{Cell, OutputRow};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

static EMPTY_CELL: Cell = Cell::Empty;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sheet `{0}` does not exist")]
    SheetNotFound(String),
    #[error("invalid range {range} on sheet `{sheet}`")]
    InvalidRange { sheet: String, range: CellRange },
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("workbook JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// Rectangular block of cells; `row` and `col` are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRange {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

impl CellRange {
    pub fn new(row: usize, col: usize, rows: usize, cols: usize) -> Self {
        Self { row, col, rows, cols }
    }

    fn is_valid(&self) -> bool {
        self.row >= 1 && self.col >= 1
    }

    fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.row && row < self.row + self.rows && col >= self.col && col < self.col + self.cols
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}C{}:{}x{}", self.row, self.col, self.rows, self.cols)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRule {
    pub range: CellRange,
    pub format: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetData {
    pub rows: Vec<Vec<Cell>>,
    #[serde(default)]
    pub formats: Vec<FormatRule>,
    #[serde(default)]
    pub column_widths: Vec<usize>,
}

impl SheetData {
    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        if row == 0 || col == 0 {
            return &EMPTY_CELL;
        }
        self.rows
            .get(row - 1)
            .and_then(|r| r.get(col - 1))
            .unwrap_or(&EMPTY_CELL)
    }

    /// Last row holding a non-blank cell; 0 when the sheet is empty.
    pub fn last_row(&self) -> usize {
        self.rows
            .iter()
            .rposition(|r| r.iter().any(|c| !c.is_blank()))
            .map_or(0, |i| i + 1)
    }

    pub fn last_column(&self) -> usize {
        self.rows
            .iter()
            .filter_map(|r| r.iter().rposition(|c| !c.is_blank()))
            .max()
            .map_or(0, |i| i + 1)
    }

    /// Values inside the used area, padded to a rectangle.
    pub fn values(&self) -> Vec<Vec<Cell>> {
        self.block(CellRange::new(1, 1, self.last_row(), self.last_column()))
    }

    /// Format applied to a cell, if any; later rules win.
    pub fn format_at(&self, row: usize, col: usize) -> Option<&str> {
        self.formats
            .iter()
            .rev()
            .find(|rule| rule.range.contains(row, col))
            .map(|rule| rule.format.as_str())
    }

    fn block(&self, range: CellRange) -> Vec<Vec<Cell>> {
        (range.row..range.row + range.rows)
            .map(|row| {
                (range.col..range.col + range.cols)
                    .map(|col| self.cell(row, col).clone())
                    .collect()
            })
            .collect()
    }

    fn put(&mut self, row: usize, col: usize, cell: Cell) {
        if self.rows.len() < row {
            self.rows.resize_with(row, Vec::new);
        }
        let line = &mut self.rows[row - 1];
        if line.len() < col {
            line.resize(col, Cell::Empty);
        }
        line[col - 1] = cell;
    }

    fn clear(&mut self, range: CellRange) {
        for row in range.row..range.row + range.rows {
            let Some(line) = self.rows.get_mut(row - 1) else {
                break;
            };
            for col in range.col..range.col + range.cols {
                if let Some(cell) = line.get_mut(col - 1) {
                    *cell = Cell::Empty;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkbookData {
    pub sheets: BTreeMap<String, SheetData>,
}

/// Spreadsheet-shaped storage used as the job's destination and cache store.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn has_sheet(&self, sheet: &str) -> Result<bool, StoreError>;

    /// Creates the sheet; a no-op when it already exists.
    async fn create_sheet(&self, sheet: &str) -> Result<(), StoreError>;

    async fn last_row(&self, sheet: &str) -> Result<usize, StoreError>;

    async fn last_column(&self, sheet: &str) -> Result<usize, StoreError>;

    async fn read_range(&self, sheet: &str, range: CellRange) -> Result<Vec<Vec<Cell>>, StoreError>;

    /// Whole used area of the sheet, empty for an empty sheet.
    async fn read_all(&self, sheet: &str) -> Result<Vec<Vec<Cell>>, StoreError>;

    async fn write_range(
        &self,
        sheet: &str,
        row: usize,
        col: usize,
        values: &[OutputRow],
    ) -> Result<(), StoreError>;

    async fn clear_range(&self, sheet: &str, range: CellRange) -> Result<(), StoreError>;

    /// Writes `values` after the last used row.
    async fn append_rows(&self, sheet: &str, values: &[OutputRow]) -> Result<(), StoreError>;

    async fn set_number_format(
        &self,
        sheet: &str,
        range: CellRange,
        format: &str,
    ) -> Result<(), StoreError>;

    async fn auto_resize_columns(&self, sheet: &str, first_col: usize, count: usize) -> Result<(), StoreError>;

    /// Makes every change so far durable.
    async fn flush(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct WorkbookState {
    data: WorkbookData,
    journal: Vec<String>,
}

/// In-memory workbook, optionally backed by a JSON file.
#[derive(Debug)]
pub struct Workbook {
    path: Option<PathBuf>,
    state: Mutex<WorkbookState>,
}

impl Workbook {
    pub fn in_memory() -> Self {
        Self::from_data(WorkbookData::default())
    }

    pub fn from_data(data: WorkbookData) -> Self {
        Self {
            path: None,
            state: Mutex::new(WorkbookState {
                data,
                journal: Vec::new(),
            }),
        }
    }

    /// Opens a file-backed workbook; a missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let exists = fs::try_exists(&path).await.map_err(|e| io_err(&path, e))?;
        let data = if exists {
            let text = fs::read_to_string(&path).await.map_err(|e| io_err(&path, e))?;
            serde_json::from_str(&text)?
        } else {
            WorkbookData::default()
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(WorkbookState {
                data,
                journal: Vec::new(),
            }),
        })
    }

    pub async fn sheet(&self, name: &str) -> Option<SheetData> {
        self.state.lock().await.data.sheets.get(name).cloned()
    }

    /// Mutating operations performed so far, one line each.
    pub async fn journal(&self) -> Vec<String> {
        self.state.lock().await.journal.clone()
    }

    async fn with_sheet<T>(
        &self,
        sheet: &str,
        op: impl FnOnce(&mut SheetData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let data = state
            .data
            .sheets
            .get_mut(sheet)
            .ok_or_else(|| StoreError::SheetNotFound(sheet.to_string()))?;
        op(data)
    }

    async fn note(&self, entry: String) {
        self.state.lock().await.journal.push(entry);
    }
}

fn check_range(sheet: &str, range: CellRange) -> Result<(), StoreError> {
    if range.is_valid() {
        Ok(())
    } else {
        Err(StoreError::InvalidRange {
            sheet: sheet.to_string(),
            range,
        })
    }
}

#[async_trait]
impl TabularStore for Workbook {
    async fn has_sheet(&self, sheet: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.data.sheets.contains_key(sheet))
    }

    async fn create_sheet(&self, sheet: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.data.sheets.contains_key(sheet) {
            state.data.sheets.insert(sheet.to_string(), SheetData::default());
            state.journal.push(format!("create {sheet}"));
        }
        Ok(())
    }

    async fn last_row(&self, sheet: &str) -> Result<usize, StoreError> {
        self.with_sheet(sheet, |s| Ok(s.last_row())).await
    }

    async fn last_column(&self, sheet: &str) -> Result<usize, StoreError> {
        self.with_sheet(sheet, |s| Ok(s.last_column())).await
    }

    async fn read_range(&self, sheet: &str, range: CellRange) -> Result<Vec<Vec<Cell>>, StoreError> {
        check_range(sheet, range)?;
        self.with_sheet(sheet, |s| Ok(s.block(range))).await
    }

    async fn read_all(&self, sheet: &str) -> Result<Vec<Vec<Cell>>, StoreError> {
        self.with_sheet(sheet, |s| Ok(s.values())).await
    }

    async fn write_range(
        &self,
        sheet: &str,
        row: usize,
        col: usize,
        values: &[OutputRow],
    ) -> Result<(), StoreError> {
        let width = values.iter().map(Vec::len).max().unwrap_or(0);
        let range = CellRange::new(row, col, values.len(), width);
        check_range(sheet, range)?;
        self.with_sheet(sheet, |s| {
            for (r, line) in values.iter().enumerate() {
                for (c, cell) in line.iter().enumerate() {
                    s.put(row + r, col + c, cell.clone());
                }
            }
            Ok(())
        })
        .await?;
        self.note(format!("write {sheet} {range}")).await;
        Ok(())
    }

    async fn clear_range(&self, sheet: &str, range: CellRange) -> Result<(), StoreError> {
        check_range(sheet, range)?;
        self.with_sheet(sheet, |s| {
            s.clear(range);
            Ok(())
        })
        .await?;
        self.note(format!("clear {sheet} {range}")).await;
        Ok(())
    }

    async fn append_rows(&self, sheet: &str, values: &[OutputRow]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let next = self.last_row(sheet).await? + 1;
        self.with_sheet(sheet, |s| {
            for (r, line) in values.iter().enumerate() {
                for (c, cell) in line.iter().enumerate() {
                    s.put(next + r, c + 1, cell.clone());
                }
            }
            Ok(())
        })
        .await?;
        self.note(format!("append {sheet} {} rows at {next}", values.len()))
            .await;
        Ok(())
    }

    async fn set_number_format(
        &self,
        sheet: &str,
        range: CellRange,
        format: &str,
    ) -> Result<(), StoreError> {
        check_range(sheet, range)?;
        self.with_sheet(sheet, |s| {
            s.formats.push(FormatRule {
                range,
                format: format.to_string(),
            });
            Ok(())
        })
        .await?;
        self.note(format!("format {sheet} {range} {format}")).await;
        Ok(())
    }

    async fn auto_resize_columns(&self, sheet: &str, first_col: usize, count: usize) -> Result<(), StoreError> {
        check_range(sheet, CellRange::new(1, first_col, 1, count))?;
        self.with_sheet(sheet, |s| {
            let needed = first_col + count - 1;
            if s.column_widths.len() < needed {
                s.column_widths.resize(needed, 0);
            }
            for col in first_col..=needed {
                let width = s
                    .rows
                    .iter()
                    .filter_map(|r| r.get(col - 1))
                    .map(|c| c.to_string().chars().count())
                    .max()
                    .unwrap_or(0);
                s.column_widths[col - 1] = width;
            }
            Ok(())
        })
        .await?;
        self.note(format!("resize {sheet} C{first_col}+{count}")).await;
        Ok(())
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            self.note("flush".to_string()).await;
            return Ok(());
        };
        let bytes = {
            let state = self.state.lock().await;
            serde_json::to_vec_pretty(&state.data)?
        };
        write_atomically(path, &bytes).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "workbook flushed");
        self.note("flush".to_string()).await;
        Ok(())
    }
}

/// Writes through a sibling temp file and renames it over the target.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| io_err(&parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| io_err(&temp_path, e))?;
    file.write_all(bytes).await.map_err(|e| io_err(&temp_path, e))?;
    file.flush().await.map_err(|e| io_err(&temp_path, e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(path, err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(cells: &[&str]) -> OutputRow {
        cells.iter().map(|c| Cell::text(*c)).collect()
    }

    #[tokio::test]
    async fn writes_extend_grid_and_track_last_row() {
        let wb = Workbook::in_memory();
        wb.create_sheet("S").await.unwrap();
        assert_eq!(wb.last_row("S").await.unwrap(), 0);

        wb.write_range("S", 2, 1, &[row(&["a", "b"]), row(&["c", "d"])])
            .await
            .unwrap();
        assert_eq!(wb.last_row("S").await.unwrap(), 3);
        assert_eq!(wb.last_column("S").await.unwrap(), 2);

        wb.clear_range("S", CellRange::new(3, 1, 1, 2)).await.unwrap();
        assert_eq!(wb.last_row("S").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn append_goes_after_last_used_row() {
        let wb = Workbook::in_memory();
        wb.create_sheet("Cache").await.unwrap();
        wb.append_rows("Cache", &[row(&["codigo", "nome"])]).await.unwrap();
        wb.append_rows("Cache", &[row(&["1", "Um"]), row(&["2", "Dois"])])
            .await
            .unwrap();

        let values = wb.read_all("Cache").await.unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[2], row(&["2", "Dois"]));
    }

    #[tokio::test]
    async fn missing_sheet_is_an_error() {
        let wb = Workbook::in_memory();
        let err = wb.last_row("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::SheetNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn zero_based_ranges_are_rejected() {
        let wb = Workbook::in_memory();
        wb.create_sheet("S").await.unwrap();
        let err = wb.clear_range("S", CellRange::new(0, 1, 1, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn formats_and_resize_are_recorded() {
        let wb = Workbook::in_memory();
        wb.create_sheet("S").await.unwrap();
        wb.write_range("S", 1, 1, &[row(&["abc", "x"])]).await.unwrap();
        wb.set_number_format("S", CellRange::new(2, 2, 5, 1), "R$ #,##0.00")
            .await
            .unwrap();
        wb.auto_resize_columns("S", 1, 2).await.unwrap();

        let sheet = wb.sheet("S").await.unwrap();
        assert_eq!(sheet.format_at(3, 2), Some("R$ #,##0.00"));
        assert_eq!(sheet.format_at(1, 2), None);
        assert_eq!(sheet.column_widths, vec![3, 1]);
    }

    #[tokio::test]
    async fn file_workbook_persists_only_on_flush() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("book.json");

        let wb = Workbook::open(&path).await.unwrap();
        wb.create_sheet("S").await.unwrap();
        wb.write_range("S", 1, 1, &[vec![Cell::Number(7.0), Cell::text("sete")]])
            .await
            .unwrap();
        assert!(!path.exists());

        wb.flush().await.unwrap();
        assert!(path.exists());

        let reopened = Workbook::open(&path).await.unwrap();
        let values = reopened.read_all("S").await.unwrap();
        assert_eq!(values, vec![vec![Cell::Number(7.0), Cell::text("sete")]]);

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
