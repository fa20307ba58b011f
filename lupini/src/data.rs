use bnn_util::context::ExecutionContext;
use bnn_util::trainer::RegressionData;
use candle_core::Tensor;
use flate2::read::GzDecoder;
use log::info;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Open a file for reading, decompressing `.gz` on the fly
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match Path::new(input_file).extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

/// Dense row-major matrix of real values
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub nrows: usize,
    pub ncols: usize,
    pub values: Vec<f64>,
    pub column_names: Option<Vec<String>>,
}

fn split_fields(line: &str) -> Vec<&str> {
    if line.contains(',') {
        line.split(',').map(|s| s.trim()).collect()
    } else {
        line.split_whitespace().collect()
    }
}

impl Matrix {
    /// Parse comma, tab or space separated values.
    ///
    /// Empty lines and lines starting with `#` are skipped. The first
    /// remaining line is a header when any field fails to parse.
    pub fn from_reader(reader: Box<dyn BufRead>) -> anyhow::Result<Self> {
        let mut values = vec![];
        let mut column_names = None;
        let mut ncols = 0;
        let mut nrows = 0;

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields = split_fields(line);
            let parsed: Result<Vec<f64>, _> = fields.iter().map(|s| s.parse::<f64>()).collect();

            let row = match parsed {
                Ok(row) => row,
                Err(e) if nrows == 0 && column_names.is_none() => {
                    log::debug!("header line {}: {}", lineno + 1, e);
                    column_names = Some(fields.iter().map(|s| s.to_string()).collect::<Vec<_>>());
                    ncols = fields.len();
                    continue;
                }
                Err(e) => anyhow::bail!("line {}: {}", lineno + 1, e),
            };

            if ncols == 0 {
                ncols = row.len();
            }
            if row.len() != ncols {
                anyhow::bail!(
                    "line {}: expected {} fields, found {}",
                    lineno + 1,
                    ncols,
                    row.len()
                );
            }
            values.extend(row);
            nrows += 1;
        }

        if nrows == 0 {
            anyhow::bail!("no data rows");
        }

        Ok(Self {
            nrows,
            ncols,
            values,
            column_names,
        })
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let mat = Self::from_reader(open_buf_reader(path)?)
            .map_err(|e| anyhow::anyhow!("{}: {}", path, e))?;
        info!("read {} x {} matrix from {}", mat.nrows, mat.ncols, path);
        Ok(mat)
    }

    pub fn row(&self, i: usize) -> &[f64] {
        &self.values[i * self.ncols..(i + 1) * self.ncols]
    }

    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut values = Vec::with_capacity(rows.len() * self.ncols);
        for &i in rows {
            values.extend_from_slice(self.row(i));
        }
        Self {
            nrows: rows.len(),
            ncols: self.ncols,
            values,
            column_names: self.column_names.clone(),
        }
    }

    fn column_mean_std(&self, j: usize) -> (f64, f64) {
        let n = self.nrows as f64;
        let mean = (0..self.nrows).map(|i| self.row(i)[j]).sum::<f64>() / n;
        let var = (0..self.nrows)
            .map(|i| (self.row(i)[j] - mean).powi(2))
            .sum::<f64>()
            / n;
        (mean, var.sqrt())
    }

    pub fn to_tensor(&self, ctx: &ExecutionContext) -> candle_core::Result<Tensor> {
        ctx.host_tensor(self.values.clone(), (self.nrows, self.ncols))
    }
}

/// Rows `0..n` shuffled with `rng` and split into (train, test).
pub fn split_rows<R: Rng>(n: usize, test_fraction: f64, rng: &mut R) -> (Vec<usize>, Vec<usize>) {
    let mut rows: Vec<usize> = (0..n).collect();
    rows.shuffle(rng);
    let ntest = ((n as f64) * test_fraction).round() as usize;
    let ntest = ntest.min(n.saturating_sub(1));
    let train = rows.split_off(ntest);
    (train, rows)
}

/// Feature standardization and output scaling fitted on training rows.
///
/// Inputs become `(x - mean) / std` (unit std for constant columns).
/// Outputs are centred; the network predicts in units of `y_std`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Standardizer {
    pub x_mean: Vec<f64>,
    pub x_std: Vec<f64>,
    pub y_mean: f64,
    pub y_std: f64,
}

impl Standardizer {
    pub fn fit(x: &Matrix, y: &Matrix) -> anyhow::Result<Self> {
        if y.ncols != 1 {
            anyhow::bail!("expected a single output column, found {}", y.ncols);
        }
        if x.nrows != y.nrows {
            anyhow::bail!("X has {} rows but Y has {}", x.nrows, y.nrows);
        }
        let (x_mean, x_std): (Vec<f64>, Vec<f64>) = (0..x.ncols)
            .map(|j| {
                let (m, s) = x.column_mean_std(j);
                (m, if s > 0.0 { s } else { 1.0 })
            })
            .unzip();
        let (y_mean, y_std) = y.column_mean_std(0);
        Ok(Self {
            x_mean,
            x_std,
            y_mean,
            y_std,
        })
    }

    /// Scale applied to the network output
    pub fn output_scaler(&self) -> f64 {
        self.y_std + f32::EPSILON as f64
    }

    pub fn transform_x(&self, x: &Matrix) -> anyhow::Result<Matrix> {
        if x.ncols != self.x_mean.len() {
            anyhow::bail!("expected {} features, found {}", self.x_mean.len(), x.ncols);
        }
        let mut out = x.clone();
        for (k, v) in out.values.iter_mut().enumerate() {
            let j = k % x.ncols;
            *v = (*v - self.x_mean[j]) / self.x_std[j];
        }
        Ok(out)
    }

    pub fn transform_y(&self, y: &Matrix) -> Matrix {
        let mut out = y.clone();
        out.values.iter_mut().for_each(|v| *v -= self.y_mean);
        out
    }

    /// Standardized tensors ready for training or scoring
    pub fn regression_data(
        &self,
        x: &Matrix,
        y: &Matrix,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<RegressionData> {
        let x_nd = self.transform_x(x)?.to_tensor(ctx)?;
        let y_n1 = self.transform_y(y).to_tensor(ctx)?;
        RegressionData::new(x_nd, y_n1)
    }
}
