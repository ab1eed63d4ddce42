use crate::utils;
use color_eyre::eyre::{eyre, Report, Result, WrapErr};
use itertools::Itertools;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// A delimited text table with a header line, used for the gene catalog,
/// genome metadata, and the ortholog/paralog intermediate artifacts.
#[derive(Clone, Debug, Default)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub path: PathBuf,
}

impl Table {
    pub fn new() -> Self {
        Table { headers: Vec::new(), rows: Vec::new(), path: PathBuf::new() }
    }

    /// Read a delimited file, first line as headers. Lines starting with
    /// '#' are tolerated as comments.
    pub fn read(path: &Path) -> Result<Table, Report> {
        let mut table = Table::new();

        // lookup delimiter from file extension
        let delim = utils::path_to_delim(path)?;

        // attempt to open the file path
        let file = File::open(path).wrap_err_with(|| eyre!("Failed to read file: {path:?}"))?;

        // read and parse lines
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            let row = line.split(delim).map(String::from).collect_vec();
            // if headers are empty, this is the first line, write headers
            if table.headers.is_empty() {
                table.headers = row;
            }
            // otherwise regular row
            else {
                table.rows.push(row);
            }
        }

        table.path = path.to_path_buf();

        Ok(table)
    }

    pub fn header_position(&self, header: &str) -> Result<usize, Report> {
        let pos = self.headers.iter().position(|h| h == header).ok_or_else(|| {
            eyre!("Column '{header}' was not found in table: {:?}.", self.path)
        })?;

        Ok(pos)
    }

    /// Get a cell by header name, with row context in the error.
    pub fn get<'a>(&self, row: &'a [String], header: &str) -> Result<&'a str, Report> {
        let pos = self.header_position(header)?;
        let cell = row.get(pos).ok_or_else(|| {
            eyre!("Row is missing column '{header}' in table: {:?}.", self.path)
        })?;
        Ok(cell)
    }

    /// write to file
    pub fn write(&self, path: &Path) -> Result<(), Report> {
        utils::create_parent_dir(&path)?;
        let mut file =
            File::create(path).wrap_err_with(|| format!("Unable to create file: {path:?}"))?;

        // Parse line delimiter from file extension
        let delim = utils::path_to_delim(path)?.to_string();

        // write headers
        let line = format!("{}\n", self.headers.iter().join(&delim));
        file.write_all(line.as_bytes())
            .wrap_err_with(|| format!("Unable to write table headers: {line}"))?;

        // write regular rows
        for row in &self.rows {
            let line = format!("{}\n", row.iter().join(&delim));
            file.write_all(line.as_bytes())
                .wrap_err_with(|| format!("Unable to write table rows: {line}"))?;
        }

        Ok(())
    }
}
