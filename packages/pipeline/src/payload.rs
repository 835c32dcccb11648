use std::path::PathBuf;

use chrono::{DateTime, Utc};
use common::TimeBounds;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// One time-indexed row of a derived table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TableRow {
    const TIME_KEY: &'static str = "time";

    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time,
            fields: Map::new(),
        }
    }

    /// Add a field. `time` is reserved for the row timestamp and is ignored.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key == Self::TIME_KEY {
            warn!("Ignoring row field named `time`, it would shadow the row timestamp");
            return self;
        }
        self.fields.insert(key, value.into());
        self
    }
}

/// Rows produced by a tabular transform.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<TableRow>,
}

impl Table {
    pub fn new(rows: Vec<TableRow>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Earliest and latest row time.
    pub fn time_bounds(&self) -> Option<TimeBounds> {
        TimeBounds::spanning(self.rows.iter().map(|r| r.time))
    }

    /// Rows whose time falls in `[start, end]`.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Table {
        Table::new(
            self.rows
                .iter()
                .filter(|r| r.time >= start && r.time <= end)
                .cloned()
                .collect(),
        )
    }
}

/// What a transform hands back to the executor.
#[derive(Clone, Debug, PartialEq)]
pub enum DerivedPayload {
    /// Rows to append to the target's tabular stream.
    Table(Table),
    /// A metadata document stored as JSON next to the processed data.
    SideCar {
        document: Value,
        bounds: Option<TimeBounds>,
    },
    /// A file the transform already wrote.
    File {
        path: PathBuf,
        bounds: Option<TimeBounds>,
    },
}

impl DerivedPayload {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            bounds: None,
        }
    }

    pub fn side_car(document: Value) -> Self {
        Self::SideCar {
            document,
            bounds: None,
        }
    }

    /// Attach explicit bounds to a side-car or file payload.
    ///
    /// A table always reports the span of its rows, so a `Table` is returned
    /// unchanged.
    pub fn with_bounds(self, bounds: TimeBounds) -> Self {
        match self {
            Self::Table(table) => Self::Table(table),
            Self::SideCar { document, .. } => Self::SideCar {
                document,
                bounds: Some(bounds),
            },
            Self::File { path, .. } => Self::File {
                path,
                bounds: Some(bounds),
            },
        }
    }

    /// Data-time bounds the payload exposes, if any.
    pub fn time_bounds(&self) -> Option<TimeBounds> {
        match self {
            Self::Table(table) => table.time_bounds(),
            Self::SideCar { bounds, .. } | Self::File { bounds, .. } => *bounds,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Table(_) => "table",
            Self::SideCar { .. } => "side-car",
            Self::File { .. } => "file",
        }
    }
}
