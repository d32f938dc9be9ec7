//! TSV readers and writers for genotype, phenotype, relationship and
//! pedigree tables.

use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array2;
use std::collections::HashMap;
use std::path::Path;

/// Biallelic dosages, markers in rows and samples in columns as on disk.
#[derive(Debug, Clone)]
pub struct GenotypeTable {
    pub marker_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    /// markers x samples, `NaN` for missing
    pub dosages: Array2<f64>,
}

impl GenotypeTable {
    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn n_markers(&self) -> usize {
        self.marker_ids.len()
    }

    /// Row-major `samples × markers` buffer.
    pub fn sample_major(&self) -> Vec<f64> {
        self.dosages.t().iter().copied().collect()
    }

    /// Row-major `samples × markers` for the given sample subset, in order.
    pub fn sample_major_subset(&self, samples: &[usize]) -> Vec<f64> {
        let mut out = Vec::with_capacity(samples.len() * self.n_markers());
        for &s in samples {
            out.extend(self.dosages.column(s).iter().copied());
        }
        out
    }
}

/// Sample identifiers with one or more numeric trait columns.
#[derive(Debug, Clone)]
pub struct PhenotypeTable {
    pub sample_ids: Vec<String>,
    pub traits: HashMap<String, Vec<f64>>,
}

impl PhenotypeTable {
    /// Records with an observed value for `trait_name`, as (sample, value).
    pub fn observed(&self, trait_name: &str) -> Result<Vec<(String, f64)>> {
        let values = self
            .traits
            .get(trait_name)
            .ok_or_else(|| anyhow!("Trait '{}' not found in phenotype file", trait_name))?;
        Ok(self
            .sample_ids
            .iter()
            .zip(values)
            .filter(|(_, v)| v.is_finite())
            .map(|(s, v)| (s.clone(), *v))
            .collect())
    }
}

/// Square labelled matrix such as a kinship or relationship matrix.
#[derive(Debug, Clone)]
pub struct LabelledMatrix {
    pub ids: Vec<String>,
    pub matrix: Array2<f64>,
}

impl LabelledMatrix {
    pub fn from_row_major(ids: Vec<String>, data: Vec<f64>) -> Result<Self> {
        let n = ids.len();
        let matrix = Array2::from_shape_vec((n, n), data).context("matrix does not match id count")?;
        Ok(Self { ids, matrix })
    }

    pub fn row_major(&self) -> Vec<f64> {
        self.matrix.iter().copied().collect()
    }

    pub fn index(&self) -> HashMap<&str, usize> {
        self.ids.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect()
    }
}

/// Pedigree rows in file order: (id, sire, dam).
#[derive(Debug, Clone)]
pub struct PedigreeTable {
    pub ids: Vec<String>,
    pub sires: Vec<Option<String>>,
    pub dams: Vec<Option<String>>,
}

fn parse_value(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") {
        f64::NAN
    } else {
        trimmed.parse::<f64>().unwrap_or(f64::NAN)
    }
}

fn parse_parent(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "0" || trimmed == "." || trimmed.eq_ignore_ascii_case("na") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn tsv_reader<P: AsRef<Path>>(path: P) -> Result<csv::Reader<std::fs::File>> {
    let path = path.as_ref();
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))
}

fn tsv_writer<P: AsRef<Path>>(path: P) -> Result<csv::Writer<std::fs::File>> {
    let path = path.as_ref();
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))
}

/// Genotype TSV: `marker_id` then one dosage column per sample.
pub fn load_genotypes_tsv<P: AsRef<Path>>(path: P) -> Result<GenotypeTable> {
    let mut rdr = tsv_reader(&path)?;
    let headers = rdr.headers()?.clone();
    if headers.len() < 2 {
        bail!("Genotype file needs at least 2 columns: marker_id, <samples...>");
    }
    let sample_ids: Vec<String> = headers.iter().skip(1).map(|s| s.to_string()).collect();
    let n_samples = sample_ids.len();

    let mut marker_ids = Vec::new();
    let mut values = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        if record.len() != n_samples + 1 {
            bail!(
                "Genotype row {} has {} fields, expected {}",
                line + 2,
                record.len(),
                n_samples + 1
            );
        }
        marker_ids.push(record.get(0).unwrap_or("").to_string());
        values.extend(record.iter().skip(1).map(parse_value));
    }
    if marker_ids.is_empty() {
        bail!("No markers found in genotype file");
    }

    let dosages = Array2::from_shape_vec((marker_ids.len(), n_samples), values)?;
    Ok(GenotypeTable {
        marker_ids,
        sample_ids,
        dosages,
    })
}

/// Phenotype TSV: `sample_id` then numeric trait columns; `NA` is missing.
pub fn load_phenotypes_tsv<P: AsRef<Path>>(path: P) -> Result<PhenotypeTable> {
    let mut rdr = tsv_reader(&path)?;
    let headers = rdr.headers()?.clone();
    if headers.len() < 2 {
        bail!("Phenotype file needs at least 2 columns: sample_id, <trait>");
    }
    let names: Vec<String> = headers.iter().skip(1).map(|s| s.to_string()).collect();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); names.len()];
    let mut sample_ids = Vec::new();

    for result in rdr.records() {
        let record = result?;
        if record.is_empty() {
            continue;
        }
        sample_ids.push(record.get(0).unwrap_or("").to_string());
        for (i, col) in columns.iter_mut().enumerate() {
            col.push(record.get(i + 1).map(parse_value).unwrap_or(f64::NAN));
        }
    }

    Ok(PhenotypeTable {
        sample_ids,
        traits: names.into_iter().zip(columns).collect(),
    })
}

/// Square matrix TSV with a `sample_id` header row and id column.
pub fn load_matrix_tsv<P: AsRef<Path>>(path: P) -> Result<LabelledMatrix> {
    let mut rdr = tsv_reader(&path)?;
    let headers = rdr.headers()?.clone();
    let ids: Vec<String> = headers.iter().skip(1).map(|s| s.to_string()).collect();
    let n = ids.len();

    let mut data = Vec::with_capacity(n * n);
    let mut rows = 0;
    for result in rdr.records() {
        let record = result?;
        let row_id = record.get(0).unwrap_or("");
        if rows >= n || row_id != ids[rows] {
            bail!("Matrix row {} ('{}') does not match header order", rows + 1, row_id);
        }
        if record.len() != n + 1 {
            bail!("Matrix row '{}' has {} fields, expected {}", row_id, record.len(), n + 1);
        }
        for field in record.iter().skip(1) {
            let v: f64 = field
                .trim()
                .parse()
                .with_context(|| format!("parsing matrix entry '{}' in row '{}'", field, row_id))?;
            data.push(v);
        }
        rows += 1;
    }
    if rows != n {
        bail!("Matrix has {} rows but {} columns", rows, n);
    }
    LabelledMatrix::from_row_major(ids, data)
}

pub fn write_matrix_tsv<P: AsRef<Path>>(path: P, m: &LabelledMatrix) -> Result<()> {
    let mut wtr = tsv_writer(path)?;

    let mut header = Vec::with_capacity(m.ids.len() + 1);
    header.push("sample_id".to_string());
    header.extend(m.ids.iter().cloned());
    wtr.write_record(&header)?;

    for (sid, values) in m.ids.iter().zip(m.matrix.rows()) {
        let mut row = Vec::with_capacity(values.len() + 1);
        row.push(sid.clone());
        row.extend(values.iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write labelled rows of numbers under the given header.
pub fn write_table_tsv<P: AsRef<Path>>(path: P, header: &[&str], rows: &[(String, Vec<f64>)]) -> Result<()> {
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(header)?;
    for (label, values) in rows {
        let mut rec = Vec::with_capacity(values.len() + 1);
        rec.push(label.clone());
        rec.extend(values.iter().map(|v| v.to_string()));
        wtr.write_record(&rec)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Pedigree TSV: `id`, `sire`, `dam`; unknown parents as `0`, `.`, `NA` or empty.
pub fn load_pedigree_tsv<P: AsRef<Path>>(path: P) -> Result<PedigreeTable> {
    let mut rdr = tsv_reader(&path)?;
    let headers = rdr.headers()?.clone();
    if headers.len() < 3 {
        bail!("Pedigree file needs 3 columns: id, sire, dam");
    }
    let mut table = PedigreeTable {
        ids: Vec::new(),
        sires: Vec::new(),
        dams: Vec::new(),
    };
    for result in rdr.records() {
        let record = result?;
        let id = record.get(0).unwrap_or("").trim().to_string();
        if id.is_empty() {
            continue;
        }
        table.ids.push(id);
        table.sires.push(record.get(1).and_then(parse_parent));
        table.dams.push(record.get(2).and_then(parse_parent));
    }
    Ok(table)
}

impl PedigreeTable {
    /// Parent indices, failing on parents that are not listed as individuals.
    pub fn parent_indices(&self) -> Result<(Vec<Option<usize>>, Vec<Option<usize>>)> {
        let index: HashMap<&str, usize> = self.ids.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();
        let lookup = |parents: &[Option<String>]| -> Result<Vec<Option<usize>>> {
            parents
                .iter()
                .map(|p| match p {
                    None => Ok(None),
                    Some(name) => index
                        .get(name.as_str())
                        .copied()
                        .map(Some)
                        .ok_or_else(|| anyhow!("Parent '{}' is not listed in the pedigree", name)),
                })
                .collect()
        };
        Ok((lookup(&self.sires)?, lookup(&self.dams)?))
    }
}
