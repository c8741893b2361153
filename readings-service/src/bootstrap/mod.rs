//! Initial load of the location / condominium / client / meter hierarchy
//! from a workbook of CSV sheets.

pub mod sheets;

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use meter_store::{CollectionPath, PartitionStore, WriteMode};

use crate::error::ServiceError;

pub use sheets::{ClientRow, CondominiumRow, LocationRow, MeterRow, Sheet, SheetRow, ID_COLUMN};

/// Directory holding one `<collection>.csv` per sheet.
#[derive(Debug, Clone)]
pub struct Workbook {
    dir: PathBuf,
}

impl Workbook {
    /// Checks every sheet is present with an id column before anything is
    /// written.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let workbook = Self {
            dir: dir.as_ref().to_path_buf(),
        };
        for sheet in Sheet::ALL {
            let mut reader = workbook.reader(sheet)?;
            let headers = reader.headers().map_err(|e| {
                ServiceError::Configuration(format!("sheet {} unreadable: {e}", sheet.file_name()))
            })?;
            if !headers.iter().any(|h| h == ID_COLUMN) {
                return Err(ServiceError::Configuration(format!(
                    "sheet {} has no '{ID_COLUMN}' column",
                    sheet.file_name()
                )));
            }
        }
        Ok(workbook)
    }

    fn reader(&self, sheet: Sheet) -> Result<csv::Reader<File>, ServiceError> {
        let path = self.dir.join(sheet.file_name());
        csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(|e| {
                ServiceError::Configuration(format!("missing sheet {}: {e}", path.display()))
            })
    }

    /// Rows of one sheet. A row that doesn't fit the sheet's schema is an
    /// `InvalidArgument` for that row only.
    pub fn rows<R: SheetRow>(
        &self,
    ) -> Result<impl Iterator<Item = Result<R, ServiceError>>, ServiceError> {
        let sheet = R::SHEET;
        Ok(self.reader(sheet)?.into_deserialize::<R>().map(move |row| {
            row.map_err(|e| ServiceError::InvalidArgument(format!("{}: {e}", sheet.file_name())))
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upsert {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub sheets: Vec<(Sheet, SheetReport)>,
}

impl BootstrapReport {
    pub fn sheet(&self, sheet: Sheet) -> Option<&SheetReport> {
        self.sheets.iter().find(|(s, _)| *s == sheet).map(|(_, r)| r)
    }

    pub fn failed(&self) -> usize {
        self.sheets.iter().map(|(_, r)| r.failed).sum()
    }
}

pub struct BootstrapLoader<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> BootstrapLoader<'a, S>
where
    S: PartitionStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Loads every sheet, parents before children.
    ///
    /// Rows with an empty or malformed id or a dangling reference are
    /// logged, counted and skipped. Any other failure stops the load.
    pub async fn load(&self, workbook: &Workbook) -> Result<BootstrapReport, ServiceError> {
        let mut report = BootstrapReport::default();
        report.sheets.push((Sheet::Location, self.load_sheet::<LocationRow>(workbook).await?));
        report.sheets.push((Sheet::Condominium, self.load_sheet::<CondominiumRow>(workbook).await?));
        report.sheets.push((Sheet::Client, self.load_sheet::<ClientRow>(workbook).await?));
        report.sheets.push((Sheet::Meter, self.load_sheet::<MeterRow>(workbook).await?));
        Ok(report)
    }

    async fn load_sheet<R: SheetRow>(&self, workbook: &Workbook) -> Result<SheetReport, ServiceError> {
        let sheet = R::SHEET.collection();
        let mut report = SheetReport::default();

        for (index, row) in workbook.rows::<R>()?.enumerate() {
            let outcome = match row {
                Ok(row) => self.upsert(&row).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(Upsert::Created) => report.created += 1,
                Ok(Upsert::Updated) => report.updated += 1,
                Ok(Upsert::Unchanged) => report.unchanged += 1,
                Err(e @ (ServiceError::NotFound(_) | ServiceError::InvalidArgument(_))) => {
                    // header is line 1
                    tracing::warn!(sheet, line = index + 2, error = %e, "row skipped");
                    metrics::counter!("bootstrap_rows_failed_total").increment(1);
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            sheet,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            "sheet loaded"
        );
        Ok(report)
    }

    async fn upsert<R: SheetRow>(&self, row: &R) -> Result<Upsert, ServiceError> {
        let id = row.id().trim();
        if id.is_empty() {
            return Err(ServiceError::InvalidArgument(format!(
                "{} row without {ID_COLUMN}",
                R::SHEET.collection()
            )));
        }

        for (collection, ref_id) in row.references() {
            let path = CollectionPath::root(collection)?.doc(ref_id).map_err(ServiceError::bad_id)?;
            if self.store.get(&path).await?.is_none() {
                return Err(ServiceError::NotFound(format!(
                    "{path} referenced by {}/{id}",
                    R::SHEET.collection()
                )));
            }
        }

        let path = CollectionPath::root(R::SHEET.collection())?.doc(id).map_err(ServiceError::bad_id)?;
        let attributes = row.attributes();

        match self.store.get(&path).await? {
            None => {
                let mut doc = R::initial_fields();
                doc.extend(attributes);
                self.store.set(&path, doc, WriteMode::Merge).await?;
                Ok(Upsert::Created)
            }
            Some(existing) => {
                let unchanged = attributes
                    .iter()
                    .all(|(field, value)| existing.get(field) == Some(value));
                if unchanged {
                    return Ok(Upsert::Unchanged);
                }
                self.store.set(&path, attributes, WriteMode::Merge).await?;
                Ok(Upsert::Updated)
            }
        }
    }
}
