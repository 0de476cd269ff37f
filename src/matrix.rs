//! In-memory gene × sample tables and their CSV representation.

use crate::error::ValidationError;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::{collections::BTreeMap, fs::File, io::Read, path::Path};

/// Count table exactly as read from disk; cells keep their raw text until
/// validation decides whether they are numeric.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CountTable {
    pub index_label: String,
    pub genes: Vec<String>,
    pub samples: Vec<String>,
    pub cells: Vec<Vec<String>>,
}

impl CountTable {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ValidationError> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| ValidationError::Unreadable(e.to_string()))?
            .clone();
        let mut header_cells = to_vec(&headers);
        if header_cells.is_empty() {
            return Err(ValidationError::EmptyInput);
        }
        let index_label = header_cells.remove(0);
        let mut table = Self {
            index_label,
            samples: header_cells,
            ..Self::default()
        };
        for record in rdr.records() {
            let record = record.map_err(|e| ValidationError::Unreadable(e.to_string()))?;
            let mut row = to_vec(&record);
            if row.is_empty() {
                continue;
            }
            table.genes.push(row.remove(0));
            table.cells.push(row);
        }
        Ok(table)
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, ValidationError> {
        let file = File::open(path).map_err(|e| {
            ValidationError::Unreadable(format!("could not open '{}': {e}", path.display()))
        })?;
        Self::from_reader(file)
    }

    pub fn from_csv_str(text: &str) -> Result<Self, ValidationError> {
        Self::from_reader(text.as_bytes())
    }
}

/// Dense numeric gene × sample matrix, row-major.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpressionMatrix {
    index_label: String,
    genes: Vec<String>,
    samples: Vec<String>,
    values: Vec<Vec<f64>>,
}

impl ExpressionMatrix {
    /// Builds a matrix, checking that every row has one value per sample.
    pub fn new(
        genes: Vec<String>,
        samples: Vec<String>,
        values: Vec<Vec<f64>>,
    ) -> Result<Self, ValidationError> {
        if genes.len() != values.len() {
            return Err(ValidationError::Unreadable(format!(
                "{} gene ids for {} value rows",
                genes.len(),
                values.len()
            )));
        }
        if let Some((idx, row)) = values
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != samples.len())
        {
            return Err(ValidationError::Unreadable(format!(
                "row '{}' has {} values, expected {}",
                genes[idx],
                row.len(),
                samples.len()
            )));
        }
        Ok(Self {
            index_label: String::new(),
            genes,
            samples,
            values,
        })
    }

    pub fn with_index_label(mut self, label: impl Into<String>) -> Self {
        self.index_label = label.into();
        self
    }

    pub fn index_label(&self) -> &str {
        &self.index_label
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn values(&self) -> &[Vec<f64>] {
        &self.values
    }

    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        &self.values[idx]
    }

    pub fn column(&self, idx: usize) -> Vec<f64> {
        self.values.iter().map(|row| row[idx]).collect()
    }

    /// Same labels, values replaced elementwise.
    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            index_label: self.index_label.clone(),
            genes: self.genes.clone(),
            samples: self.samples.clone(),
            values: self
                .values
                .iter()
                .map(|row| row.iter().map(|&v| f(v)).collect())
                .collect(),
        }
    }

    /// Same labels, each row replaced by `f(row)`.
    pub fn map_rows(&self, f: impl Fn(&[f64]) -> Vec<f64>) -> Self {
        Self {
            index_label: self.index_label.clone(),
            genes: self.genes.clone(),
            samples: self.samples.clone(),
            values: self.values.iter().map(|row| f(row)).collect(),
        }
    }

    /// Rows picked (and ordered) by `indices`; columns untouched.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            index_label: self.index_label.clone(),
            genes: indices.iter().map(|&i| self.genes[i].clone()).collect(),
            samples: self.samples.clone(),
            values: indices.iter().map(|&i| self.values[i].clone()).collect(),
        }
    }

    /// Columns picked (and ordered) by `indices`; rows untouched.
    pub fn select_columns(&self, indices: &[usize]) -> Self {
        Self {
            index_label: self.index_label.clone(),
            genes: self.genes.clone(),
            samples: indices.iter().map(|&j| self.samples[j].clone()).collect(),
            values: self
                .values
                .iter()
                .map(|row| indices.iter().map(|&j| row[j]).collect())
                .collect(),
        }
    }

    /// Sample-major copy of the values (one vector per column).
    pub fn transposed_values(&self) -> Vec<Vec<f64>> {
        (0..self.n_samples()).map(|j| self.column(j)).collect()
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<String>, Vec<Vec<f64>>) {
        (self.genes, self.samples, self.values)
    }

    pub fn to_csv_string(&self) -> Result<String, String> {
        let mut wtr = WriterBuilder::new().from_writer(vec![]);
        let mut header = vec![self.index_label.clone()];
        header.extend(self.samples.iter().cloned());
        wtr.write_record(&header)
            .map_err(|e| format!("Could not write CSV header: {e}"))?;
        for (gene, row) in self.genes.iter().zip(&self.values) {
            let mut record = Vec::with_capacity(row.len() + 1);
            record.push(gene.clone());
            record.extend(row.iter().map(|v| v.to_string()));
            wtr.write_record(&record)
                .map_err(|e| format!("Could not write CSV row '{gene}': {e}"))?;
        }
        let bytes = wtr
            .into_inner()
            .map_err(|e| format!("Could not flush CSV output: {e}"))?;
        String::from_utf8(bytes).map_err(|e| format!("CSV output is not UTF-8: {e}"))
    }
}

/// Sample → condition assignment with any extra columns carried verbatim.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DesignTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl DesignTable {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ValidationError> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
        let columns = to_vec(
            rdr.headers()
                .map_err(|e| ValidationError::Unreadable(e.to_string()))?,
        )
        .into_iter()
        .map(|c| c.trim().to_string())
        .collect();
        let mut rows = vec![];
        for record in rdr.records() {
            let record = record.map_err(|e| ValidationError::Unreadable(e.to_string()))?;
            rows.push(to_vec(&record));
        }
        Ok(Self { columns, rows })
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, ValidationError> {
        let file = File::open(path).map_err(|e| {
            ValidationError::Unreadable(format!("could not open '{}': {e}", path.display()))
        })?;
        Self::from_reader(file)
    }

    pub fn from_csv_str(text: &str) -> Result<Self, ValidationError> {
        Self::from_reader(text.as_bytes())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column_values(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).map(String::as_str).unwrap_or(""))
                .collect(),
        )
    }

    pub fn samples(&self) -> Vec<&str> {
        self.column_values("sample").unwrap_or_default()
    }

    pub fn conditions(&self) -> Vec<&str> {
        self.column_values("condition").unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One map per row, keyed by column name.
    pub fn records(&self) -> Vec<BTreeMap<String, String>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.iter())
                    .map(|(c, v)| (c.clone(), v.clone()))
                    .collect()
            })
            .collect()
    }

    pub fn to_csv_string(&self) -> Result<String, String> {
        let mut wtr = WriterBuilder::new().from_writer(vec![]);
        wtr.write_record(&self.columns)
            .map_err(|e| format!("Could not write design header: {e}"))?;
        for row in &self.rows {
            wtr.write_record(row)
                .map_err(|e| format!("Could not write design row: {e}"))?;
        }
        let bytes = wtr
            .into_inner()
            .map_err(|e| format!("Could not flush design output: {e}"))?;
        String::from_utf8(bytes).map_err(|e| format!("Design output is not UTF-8: {e}"))
    }
}

fn to_vec(record: &StringRecord) -> Vec<String> {
    record.iter().map(|s| s.to_string()).collect()
}
