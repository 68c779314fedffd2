//! Recorded query results.
//!
//! `ReplayMetrics` answers instant queries from a fixed table keyed by the
//! exact expression text, which lets a graph be enriched offline from a
//! capture of real store responses. Expressions with no recording answer an
//! empty vector, the same as a store with no matching series.
//!
//! The most recent expressions are kept in a bounded log for inspection.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use crate::error::MetricsError;

use super::{MetricsApi, MetricsResult, Vector};

/// Default number of expressions kept by the query log.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// A [`MetricsApi`] backed by recorded responses.
#[derive(Debug)]
pub struct ReplayMetrics {
    recorded: HashMap<String, Vector>,
    seen: Mutex<VecDeque<String>>,
    log_capacity: usize,
}

impl Default for ReplayMetrics {
    fn default() -> Self {
        Self {
            recorded: HashMap::new(),
            seen: Mutex::new(VecDeque::new()),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl ReplayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` expressions in the query log, oldest dropped first.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Record the answer for `expression`.
    pub fn with_response(mut self, expression: impl Into<String>, vector: Vector) -> Self {
        self.insert(expression, vector);
        self
    }

    pub fn insert(&mut self, expression: impl Into<String>, vector: Vector) {
        self.recorded.insert(expression.into(), vector);
    }

    /// Parse a JSON object of `expression → [sample, ...]`.
    pub fn from_json(json: &str) -> MetricsResult<Self> {
        let recorded: HashMap<String, Vector> =
            serde_json::from_str(json).map_err(|e| MetricsError::Replay {
                path: "<inline>".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            recorded,
            ..Self::default()
        })
    }

    /// Load recorded responses from a JSON file.
    pub fn load(path: &Path) -> MetricsResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| MetricsError::Replay {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&content).map_err(|e| match e {
            MetricsError::Replay { message, .. } => MetricsError::Replay {
                path: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    /// The most recent expressions queried, in call order.
    pub fn queries_seen(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }
}

impl MetricsApi for ReplayMetrics {
    fn query(&self, expression: &str, _time: SystemTime) -> MetricsResult<Vector> {
        if self.log_capacity > 0 {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            if seen.len() == self.log_capacity {
                seen.pop_front();
            }
            seen.push_back(expression.to_string());
        }

        match self.recorded.get(expression) {
            Some(vector) => Ok(vector.clone()),
            None => {
                tracing::trace!(query = expression, "no recorded response");
                Ok(Vector::new())
            }
        }
    }
}
