//! Historical dataset extraction.
//!
//! Each dependency of an expression is read as a full `(step, rank, value)`
//! series, reduced across ranks per step, and merge-joined with the other
//! dependencies by step. The compiled expression is then evaluated at each
//! joined step. A division by zero drops that step only.

use std::io::Write;
use std::path::Path;

use steplog_types::{CapturedRecord, RecordKind, SeriesPoint};
use tracing::debug;

use crate::error::LogError;
use crate::expr::EvalError;
use crate::join::merge_join;
use crate::manager::LogManager;
use crate::resolve::{DependencyDatum, resolve};

/// An expression to extract, with optional overrides for its labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRequest {
    /// Expression text.
    pub expr: String,
    /// Description; defaults to the expression text.
    pub description: Option<String>,
    /// Unit; inferred from the dependencies when `None`.
    pub unit: Option<String>,
}

impl DatasetRequest {
    /// Extract `expr` with inferred labels.
    pub fn new(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            description: None,
            unit: None,
        }
    }

    /// Override the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Override the unit.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

impl From<&str> for DatasetRequest {
    fn from(expr: &str) -> Self {
        Self::new(expr)
    }
}

/// A time series computed from an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// Description of the series.
    pub description: String,
    /// Unit, if known.
    pub unit: Option<String>,
    /// `(step, value)` pairs in ascending step order.
    pub points: Vec<(u64, f64)>,
}

/// Several series joined on their common steps.
#[derive(Debug, Clone, PartialEq)]
pub struct JointDataset {
    /// One description per expression.
    pub descriptions: Vec<String>,
    /// One unit per expression.
    pub units: Vec<Option<String>>,
    /// `(step, [value per expression])` in ascending step order.
    pub rows: Vec<(u64, Vec<f64>)>,
}

/// One axis of plot data.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotAxis {
    /// Values, aligned with the other axis.
    pub data: Vec<f64>,
    /// Axis description.
    pub description: String,
    /// Axis unit, if known.
    pub unit: Option<String>,
}

impl LogManager {
    /// Every stored sample of one quantity, ordered by step then rank.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownQuantity`] for an unregistered name or
    /// [`LogError::Db`] if the read fails.
    pub fn table(&self, name: &str) -> Result<Vec<SeriesPoint>, LogError> {
        if self.quantity_meta(name).is_none() {
            return Err(LogError::UnknownQuantity { name: name.to_owned() });
        }
        Ok(self.store().read_series(name)?)
    }

    /// Captured warnings, flushed ones only.
    pub fn warnings(&self) -> Result<Vec<CapturedRecord>, LogError> {
        Ok(self.store().read_records(RecordKind::Warning)?)
    }

    /// Captured log events, flushed ones only.
    pub fn logging_records(&self) -> Result<Vec<CapturedRecord>, LogError> {
        Ok(self.store().read_records(RecordKind::Logging)?)
    }

    /// Compute the time series of an expression.
    ///
    /// # Errors
    ///
    /// - [`LogError::Expr`] if the expression does not resolve.
    /// - [`LogError::Eval`] for evaluation failures other than division by
    ///   zero.
    /// - [`LogError::Db`] if a series cannot be read.
    pub fn expr_dataset(&self, request: impl Into<DatasetRequest>) -> Result<Dataset, LogError> {
        let request = request.into();
        let resolved = resolve(self.frontend(), &request.expr, &self.scope())?;

        let series = resolved
            .deps
            .iter()
            .map(|dep| self.reduced_series(dep))
            .collect::<Result<Vec<_>, _>>()?;

        let mut points = Vec::new();
        let mut dropped = 0_usize;
        for (step, values) in merge_join(series) {
            match resolved.eval(&values) {
                Ok(value) => points.push((step, value)),
                Err(EvalError::DivisionByZero) => dropped = dropped.saturating_add(1),
                Err(source) => return Err(source.into()),
            }
        }
        debug!(expr = %request.expr, points = points.len(), dropped, "Extracted dataset");

        Ok(Dataset {
            description: request.description.unwrap_or(request.expr),
            unit: request.unit.or(resolved.unit),
            points,
        })
    }

    /// Compute several expressions and keep the steps they share.
    ///
    /// # Errors
    ///
    /// Propagates [`LogManager::expr_dataset`] errors.
    pub fn joint_dataset<I, R>(&self, requests: I) -> Result<JointDataset, LogError>
    where
        I: IntoIterator<Item = R>,
        R: Into<DatasetRequest>,
    {
        let mut descriptions = Vec::new();
        let mut units = Vec::new();
        let mut series = Vec::new();
        for request in requests {
            let dataset = self.expr_dataset(request)?;
            descriptions.push(dataset.description);
            units.push(dataset.unit);
            series.push(dataset.points);
        }
        Ok(JointDataset {
            descriptions,
            units,
            rows: merge_join(series).collect(),
        })
    }

    /// Two aligned axes for plotting `y` against `x`, restricted to the
    /// inclusive step range.
    ///
    /// # Errors
    ///
    /// Propagates [`LogManager::expr_dataset`] errors.
    pub fn plot_data(
        &self,
        x: impl Into<DatasetRequest>,
        y: impl Into<DatasetRequest>,
        min_step: Option<u64>,
        max_step: Option<u64>,
    ) -> Result<(PlotAxis, PlotAxis), LogError> {
        let joint = self.joint_dataset([x.into(), y.into()])?;
        let mut descriptions = joint.descriptions.into_iter();
        let mut units = joint.units.into_iter();
        let mut axis = || PlotAxis {
            data: Vec::new(),
            description: descriptions.next().unwrap_or_default(),
            unit: units.next().flatten(),
        };
        let (mut x_axis, mut y_axis) = (axis(), axis());

        for (step, values) in joint.rows {
            if min_step.is_some_and(|min| step < min) || max_step.is_some_and(|max| step > max) {
                continue;
            }
            if let [x_value, y_value] = values.as_slice() {
                x_axis.data.push(*x_value);
                y_axis.data.push(*y_value);
            }
        }
        Ok((x_axis, y_axis))
    }

    /// Write `y` against `x` as a tab-separated text file with a `#` header.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the file cannot be written, or any
    /// [`LogManager::plot_data`] error.
    pub fn write_datafile(
        &self,
        path: &Path,
        x: impl Into<DatasetRequest>,
        y: impl Into<DatasetRequest>,
    ) -> Result<(), LogError> {
        let (x_axis, y_axis) = self.plot_data(x, y, None, None)?;
        let mut text = format!("# {} vs. {}\n", x_axis.description, y_axis.description);
        for (x_value, y_value) in x_axis.data.iter().zip(&y_axis.data) {
            text.push_str(&format!("{x_value:?}\t{y_value:?}\n"));
        }
        let io_err = |source: std::io::Error| LogError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = std::fs::File::create(path).map_err(io_err)?;
        file.write_all(text.as_bytes()).map_err(io_err)?;
        Ok(())
    }

    /// Read one dependency and reduce it across ranks at each step. Steps
    /// where the reduction has no value are skipped.
    fn reduced_series(&self, dep: &DependencyDatum) -> Result<Vec<(u64, f64)>, LogError> {
        let points = self.table(&dep.name)?;
        let mut out = Vec::new();
        let mut group: Vec<(u32, f64)> = Vec::new();
        let mut current = None;
        for point in points {
            if current.is_some_and(|step| step != point.step) {
                self.flush_group(dep, current, &mut group, &mut out);
            }
            current = Some(point.step);
            group.push((point.rank, point.value));
        }
        self.flush_group(dep, current, &mut group, &mut out);
        Ok(out)
    }

    fn flush_group(
        &self,
        dep: &DependencyDatum,
        step: Option<u64>,
        group: &mut Vec<(u32, f64)>,
        out: &mut Vec<(u64, f64)>,
    ) {
        if let Some(step) = step {
            if let Some(value) = dep.reduction.apply(group, self.rank(), self.registry()) {
                out.push((step, value));
            }
        }
        group.clear();
    }
}
