//! Append-only, comma-delimited trajectory log.
//!
//! One row per executed step of every rollout. Floats are written in their
//! shortest round-trip form, so a row parsed back yields bit-identical values.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{StressError, StressResult};
use crate::simulator::{OutputKind, Simulator, StepExtension};
use crate::trajectory::{SimulationOutcome, StepRecord};

const TRUE: &str = "TRUE";
const FALSE: &str = "FALSE";

/// Column layout of a trajectory log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSchema {
    pub noise_dim: usize,
    pub state_dim: usize,
    /// Whether reward/uncertainty columns are present.
    pub extended: bool,
}

impl LogSchema {
    pub fn new(noise_dim: usize, state_dim: usize, kind: OutputKind) -> Self {
        Self {
            noise_dim,
            state_dim,
            extended: kind == OutputKind::Extended,
        }
    }

    pub fn for_simulator<S: Simulator + ?Sized>(noise_dim: usize, simulator: &S) -> Self {
        Self::new(noise_dim, simulator.state_dim(), simulator.output_kind())
    }

    pub fn output_kind(&self) -> OutputKind {
        if self.extended {
            OutputKind::Extended
        } else {
            OutputKind::Base
        }
    }

    pub fn columns(&self) -> usize {
        let extension = if self.extended { 2 } else { 0 };
        3 + self.noise_dim + extension + 1 + self.state_dim + 6
    }

    pub fn header(&self) -> String {
        let mut fields: Vec<String> = vec!["generation".into(), "member".into(), "step".into()];
        fields.extend((0..self.noise_dim).map(|i| format!("noise_{i}")));
        if self.extended {
            fields.push("reward".into());
            fields.push("uncertainty".into());
        }
        fields.push("risk".into());
        fields.extend((0..self.state_dim).map(|i| format!("state_{i}")));
        fields.extend(
            [
                "log_p",
                "log_q",
                "cumulative_log_p",
                "cumulative_log_q",
                "collided",
                "simulation_collided",
            ]
            .map(String::from),
        );
        fields.join(",")
    }

    /// Recovers the layout from a header row.
    pub fn from_header(line: &str) -> StressResult<Self> {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        let noise_dim = fields.iter().filter(|f| f.starts_with("noise_")).count();
        let state_dim = fields.iter().filter(|f| f.starts_with("state_")).count();
        let extended = fields.contains(&"reward");
        let schema = Self {
            noise_dim,
            state_dim,
            extended,
        };
        if schema.header() != line.trim_end() {
            return Err(StressError::LogParse {
                line: 1,
                reason: format!("unrecognised header `{}`", line.trim_end()),
            });
        }
        Ok(schema)
    }

    pub fn format_row(&self, record: &StepRecord) -> StressResult<String> {
        self.check_widths(record)?;
        let mut fields: Vec<String> = Vec::with_capacity(self.columns());
        fields.push(record.generation.to_string());
        fields.push(record.member.to_string());
        fields.push(record.step.to_string());
        fields.extend(record.noise.iter().map(f64::to_string));
        if self.extended {
            let extension = record.extension.ok_or_else(|| StressError::OutputKindMismatch {
                generation: record.generation,
                member: record.member,
                step: record.step,
            })?;
            fields.push(extension.reward.to_string());
            fields.push(extension.uncertainty.to_string());
        }
        fields.push(record.risk.to_string());
        fields.extend(record.state.iter().map(f64::to_string));
        fields.push(record.log_p.to_string());
        fields.push(record.log_q.to_string());
        fields.push(record.cumulative_log_p.to_string());
        fields.push(record.cumulative_log_q.to_string());
        fields.push(flag(record.collided).to_string());
        fields.push(flag(record.simulation_collided).to_string());
        Ok(fields.join(","))
    }

    pub fn parse_row(&self, line_no: usize, line: &str) -> StressResult<StepRecord> {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        if fields.len() != self.columns() {
            return Err(StressError::LogParse {
                line: line_no,
                reason: format!("expected {} columns, found {}", self.columns(), fields.len()),
            });
        }
        let mut cursor = Cursor {
            fields: &fields,
            at: 0,
            line: line_no,
        };
        let generation = cursor.index()?;
        let member = cursor.index()?;
        let step = cursor.index()?;
        let noise = cursor.floats(self.noise_dim)?;
        let extension = if self.extended {
            Some(StepExtension {
                reward: cursor.float()?,
                uncertainty: cursor.float()?,
            })
        } else {
            None
        };
        let risk = cursor.float()?;
        let state = cursor.floats(self.state_dim)?;
        Ok(StepRecord {
            generation,
            member,
            step,
            noise,
            extension,
            risk,
            state,
            log_p: cursor.float()?,
            log_q: cursor.float()?,
            cumulative_log_p: cursor.float()?,
            cumulative_log_q: cursor.float()?,
            collided: cursor.flag()?,
            simulation_collided: cursor.flag()?,
        })
    }

    fn check_widths(&self, record: &StepRecord) -> StressResult<()> {
        if record.noise.len() != self.noise_dim {
            return Err(StressError::DimensionMismatch {
                context: "logged noise",
                expected: self.noise_dim,
                actual: record.noise.len(),
            });
        }
        if record.state.len() != self.state_dim {
            return Err(StressError::DimensionMismatch {
                context: "logged state",
                expected: self.state_dim,
                actual: record.state.len(),
            });
        }
        Ok(())
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        TRUE
    } else {
        FALSE
    }
}

struct Cursor<'a> {
    fields: &'a [&'a str],
    at: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn next(&mut self) -> &'a str {
        let field = self.fields[self.at].trim();
        self.at += 1;
        field
    }

    fn error(&self, what: &str, field: &str) -> StressError {
        StressError::LogParse {
            line: self.line,
            reason: format!("column {} is not a valid {what}: `{field}`", self.at),
        }
    }

    fn index(&mut self) -> StressResult<usize> {
        let field = self.next();
        field.parse().map_err(|_| self.error("index", field))
    }

    fn float(&mut self) -> StressResult<f64> {
        let field = self.next();
        field.parse().map_err(|_| self.error("number", field))
    }

    fn floats(&mut self, count: usize) -> StressResult<Vec<f64>> {
        (0..count).map(|_| self.float()).collect()
    }

    fn flag(&mut self) -> StressResult<bool> {
        let field = self.next();
        match field {
            "TRUE" | "true" | "True" => Ok(true),
            "FALSE" | "false" | "False" => Ok(false),
            _ => Err(self.error("flag", field)),
        }
    }
}

/// Shared writer over the trajectory log. Rows of one rollout are written
/// together under the lock and flushed before the lock is released.
pub struct TrajectoryLog {
    path: PathBuf,
    schema: LogSchema,
    writer: Mutex<BufWriter<File>>,
}

impl TrajectoryLog {
    /// Opens `path` for appending. An empty or missing file receives a header
    /// row; an existing header must match `schema`.
    pub fn open<P: AsRef<Path>>(path: P, schema: LogSchema) -> StressResult<Self> {
        let path = path.as_ref();
        let open_error = |source| StressError::LogOpen {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .map_err(open_error)?;
        let empty = file.metadata().map_err(open_error)?.len() == 0;
        let mut writer = BufWriter::new(file);
        if empty {
            writeln!(writer, "{}", schema.header()).map_err(open_error)?;
            writer.flush().map_err(open_error)?;
        } else {
            let existing = read_header(path)?;
            if existing != schema {
                return Err(StressError::LogParse {
                    line: 1,
                    reason: format!(
                        "existing log has layout {existing:?}, run expects {schema:?}"
                    ),
                });
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            schema,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> LogSchema {
        self.schema
    }

    /// Appends every step of `outcome` and flushes.
    pub fn append(&self, outcome: &SimulationOutcome) -> StressResult<()> {
        let rows = outcome
            .records
            .iter()
            .map(|record| self.schema.format_row(record))
            .collect::<StressResult<Vec<_>>>()?;
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (record, row) in outcome.records.iter().zip(&rows) {
            writeln!(writer, "{row}").map_err(|source| StressError::LogIo {
                generation: record.generation,
                member: record.member,
                step: record.step,
                source,
            })?;
        }
        writer.flush().map_err(|source| StressError::LogIo {
            generation: outcome.generation,
            member: outcome.member,
            step: outcome.records.len().saturating_sub(1),
            source,
        })
    }

    /// Parses a whole log, returning its layout and every row in file order.
    pub fn read<P: AsRef<Path>>(path: P) -> StressResult<(LogSchema, Vec<StepRecord>)> {
        let path = path.as_ref();
        let read_error = |source| StressError::LogOpen {
            path: path.to_path_buf(),
            source,
        };
        let reader = BufReader::new(File::open(path).map_err(read_error)?);
        let mut lines = reader.lines();
        let header = match lines.next() {
            Some(line) => line.map_err(read_error)?,
            None => {
                return Err(StressError::LogParse {
                    line: 1,
                    reason: "log is empty".into(),
                })
            }
        };
        let schema = LogSchema::from_header(&header)?;
        let mut records = Vec::new();
        for (offset, line) in lines.enumerate() {
            let line = line.map_err(read_error)?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(schema.parse_row(offset + 2, &line)?);
        }
        Ok((schema, records))
    }
}

fn read_header(path: &Path) -> StressResult<LogSchema> {
    let file = File::open(path).map_err(|source| StressError::LogOpen {
        path: path.to_path_buf(),
        source,
    })?;
    let mut header = String::new();
    BufReader::new(file)
        .read_line(&mut header)
        .map_err(|source| StressError::LogOpen {
            path: path.to_path_buf(),
            source,
        })?;
    LogSchema::from_header(&header)
}

/// Groups log rows by `(generation, member)`, keeping step order.
pub fn group_by_member(records: Vec<StepRecord>) -> BTreeMap<(usize, usize), Vec<StepRecord>> {
    let mut grouped: BTreeMap<(usize, usize), Vec<StepRecord>> = BTreeMap::new();
    for record in records {
        grouped
            .entry((record.generation, record.member))
            .or_default()
            .push(record);
    }
    for rows in grouped.values_mut() {
        rows.sort_by_key(|record| record.step);
    }
    grouped
}
