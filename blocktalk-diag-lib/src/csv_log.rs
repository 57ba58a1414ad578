//! Sample logging.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveTime};
use log::info;

/// Destination for sample rows.
pub trait LogSink: Send {
    /// Start a new section with these column headings (time column excluded).
    fn write_header(&mut self, columns: &[String]) -> io::Result<()>;
    fn write_row(&mut self, time: NaiveTime, values: &[String]) -> io::Result<()>;
}

/// Append `field`, quoting it when it holds a comma, quote or line break.
fn push_field(line: &mut String, field: &str) {
    line.push(',');
    if field.contains([',', '"', '\n', '\r']) {
        line.push('"');
        line.push_str(&field.replace('"', "\"\""));
        line.push('"');
    } else {
        line.push_str(field);
    }
}

/// Comma-separated log: `Time,<col>,...` then `HH:MM:SS.mmm,<value>,...`.
/// Every line is flushed as it is written.
pub struct CsvLogSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> CsvLogSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl CsvLogSink<BufWriter<File>> {
    /// Create `<dir>/YYYY-MM-DD_HH-MM-SS.csv`, creating `dir` if needed.
    pub fn create_in(dir: &Path) -> io::Result<(Self, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Local::now().format("%Y-%m-%d_%H-%M-%S.csv").to_string());
        let file = File::create(&path)?;
        info!("Logging samples to {}", path.display());
        Ok((Self::new(BufWriter::new(file)), path))
    }
}

impl<W: Write + Send> LogSink for CsvLogSink<W> {
    fn write_header(&mut self, columns: &[String]) -> io::Result<()> {
        let mut line = String::from("Time");
        for column in columns {
            push_field(&mut line, column);
        }
        writeln!(self.writer, "{line}")?;
        self.writer.flush()
    }

    fn write_row(&mut self, time: NaiveTime, values: &[String]) -> io::Result<()> {
        let mut line = time.format("%H:%M:%S%.3f").to_string();
        for value in values {
            push_field(&mut line, value);
        }
        writeln!(self.writer, "{line}")?;
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_and_rows() {
        let mut sink = CsvLogSink::new(Vec::new());
        sink.write_header(&["Engine Speed [rpm]".to_string(), "Coolant [° C]".to_string()])
            .unwrap();
        let time = NaiveTime::from_hms_milli_opt(13, 5, 9, 42).unwrap();
        sink.write_row(time, &["800".to_string(), "90".to_string()]).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text, "Time,Engine Speed [rpm],Coolant [° C]\n13:05:09.042,800,90\n");
    }

    #[test]
    fn test_text_fields_are_quoted() {
        let mut sink = CsvLogSink::new(Vec::new());
        sink.write_header(&["Mode [ASCII]".to_string(), "Idle, warm [Binary]".to_string()])
            .unwrap();
        let time = NaiveTime::from_hms_milli_opt(0, 0, 1, 0).unwrap();
        sink.write_row(time, &["D,4".to_string(), "say \"hi\"".to_string()]).unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            text,
            "Time,Mode [ASCII],\"Idle, warm [Binary]\"\n00:00:01.000,\"D,4\",\"say \"\"hi\"\"\"\n"
        );
    }

    /// Counts flushes so the test can see each row reach the writer.
    #[derive(Default)]
    struct FlushCounter {
        written: Vec<u8>,
        flushes: usize,
    }

    impl Write for FlushCounter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_every_row_is_flushed() {
        let mut sink = CsvLogSink::new(FlushCounter::default());
        sink.write_header(&["A [V]".to_string()]).unwrap();
        let time = NaiveTime::from_hms_milli_opt(0, 0, 0, 0).unwrap();
        sink.write_row(time, &["1".to_string()]).unwrap();
        sink.write_row(time, &["2".to_string()]).unwrap();

        let counter = sink.into_inner();
        assert_eq!(counter.flushes, 3);
        assert_eq!(counter.written.iter().filter(|&&b| b == b'\n').count(), 3);
    }

    #[test]
    fn test_create_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("Logs");
        let (mut sink, path) = CsvLogSink::create_in(&logs).unwrap();
        sink.write_header(&["A [V]".to_string()]).unwrap();
        drop(sink);

        assert!(path.starts_with(&logs));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("csv"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Time,A [V]\n");
    }
}
