use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Named-scalar sink for training diagnostics. Values recorded since
/// the last dump belong to one reporting interval.
pub trait TelemetrySink: Send {
    fn record(&mut self, key: &str, value: f64);
    fn dump(&mut self, step: u64);
}

/// Discards everything.
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&mut self, _key: &str, _value: f64) {}

    fn dump(&mut self, _step: u64) {}
}

/// Prints one block of key/value pairs per dump to stdout.
pub struct ConsoleSink {
    pending: BTreeMap<String, f64>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for ConsoleSink {
    fn record(&mut self, key: &str, value: f64) {
        self.pending.insert(key.to_string(), value);
    }

    fn dump(&mut self, step: u64) {
        println!("---- step {} ----", step);
        for (key, value) in &self.pending {
            println!("{:<32} {:>14.5}", key, value);
        }
        self.pending.clear();
    }
}

/// Appends one CSV row per dump. The header is fixed by the keys seen
/// before the first dump; later keys are ignored with a warning.
pub struct CsvSink {
    writer: BufWriter<File>,
    columns: Vec<String>,
    pending: BTreeMap<String, f64>,
    header_written: bool,
}

impl CsvSink {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
            columns: Vec::new(),
            pending: BTreeMap::new(),
            header_written: false,
        })
    }
}

impl TelemetrySink for CsvSink {
    fn record(&mut self, key: &str, value: f64) {
        if self.header_written && !self.columns.iter().any(|c| c == key) {
            log::warn!("csv sink ignoring key {} introduced after the header", key);
            return;
        }
        self.pending.insert(key.to_string(), value);
    }

    fn dump(&mut self, step: u64) {
        if !self.header_written {
            self.columns = self.pending.keys().cloned().collect();
            let header = self.columns.join(",");
            if let Err(e) = writeln!(self.writer, "step,{}", header) {
                log::error!("csv sink failed to write header: {}", e);
            }
            self.header_written = true;
        }

        let mut row = step.to_string();
        for column in &self.columns {
            row.push(',');
            if let Some(value) = self.pending.get(column) {
                row.push_str(&value.to_string());
            }
        }
        if let Err(e) = writeln!(self.writer, "{}", row) {
            log::error!("csv sink failed to write row: {}", e);
        }
        if let Err(e) = self.writer.flush() {
            log::error!("csv sink failed to flush: {}", e);
        }
        self.pending.clear();
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Fans records out to several sinks.
pub struct MultiSink {
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Default for MultiSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for MultiSink {
    fn record(&mut self, key: &str, value: f64) {
        for sink in &mut self.sinks {
            sink.record(key, value);
        }
    }

    fn dump(&mut self, step: u64) {
        for sink in &mut self.sinks {
            sink.dump(step);
        }
    }
}
