//! Iteration history sinks.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use tracing::warn;

/// One iteration of one solver on one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub rank: usize,
    pub path: String,
    pub solver: String,
    pub iteration: usize,
    pub norm: f64,
    /// The solving group's slice of the output vector on this worker.
    pub values: Vec<f64>,
}

pub trait Recorder {
    fn record(&mut self, record: &IterationRecord);
}

/// Keeps records in memory. Clones share the same log, so a handle kept by
/// the caller sees what the problem records.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    records: Rc<RefCell<Vec<IterationRecord>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<IterationRecord> {
        self.records.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.records.borrow_mut().clear();
    }
}

impl Recorder for MemoryRecorder {
    fn record(&mut self, record: &IterationRecord) {
        self.records.borrow_mut().push(record.clone());
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesRecorder<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Recorder for JsonLinesRecorder<W> {
    fn record(&mut self, record: &IterationRecord) {
        let written = serde_json::to_writer(&mut self.writer, record)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));
        if let Err(err) = written {
            warn!(path = %record.path, error = %err, "failed to write iteration record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(iteration: usize) -> IterationRecord {
        IterationRecord {
            rank: 0,
            path: "cycle".to_string(),
            solver: "NLGS".to_string(),
            iteration,
            norm: 0.5,
            values: vec![1.0, 2.0],
        }
    }

    #[test]
    fn memory_recorder_handles_share_the_log() {
        let handle = MemoryRecorder::new();
        let mut sink: Box<dyn Recorder> = Box::new(handle.clone());
        sink.record(&sample(1));
        sink.record(&sample(2));
        assert_eq!(handle.len(), 2);
        assert_eq!(handle.records()[1].iteration, 2);
        handle.clear();
        assert!(handle.is_empty());
    }

    #[test]
    fn json_lines_round_trip() {
        let mut recorder = JsonLinesRecorder::new(Vec::new());
        recorder.record(&sample(1));
        recorder.record(&sample(2));
        let text = String::from_utf8(recorder.into_inner()).unwrap();
        let parsed: Vec<IterationRecord> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed, vec![sample(1), sample(2)]);
    }
}
