use std::fs::File;
use std::io::{BufRead, BufReader, Lines, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use super::{RecordingError, RecordingEvent, RecordingHeader};

/// Streaming reader over a recording. Iterates events after the header.
pub struct RecordingReader<R: BufRead> {
    header: RecordingHeader,
    lines: Lines<R>,
}

impl RecordingReader<BufReader<GzDecoder<File>>> {
    pub fn open(path: &Path) -> Result<Self, RecordingError> {
        Self::from_gzip(File::open(path)?)
    }
}

impl<R: Read> RecordingReader<BufReader<GzDecoder<R>>> {
    pub fn from_gzip(inner: R) -> Result<Self, RecordingError> {
        Self::new(BufReader::new(GzDecoder::new(inner)))
    }
}

impl<R: BufRead> RecordingReader<R> {
    /// Wrap an already decompressed stream.
    pub fn new(reader: R) -> Result<Self, RecordingError> {
        let mut lines = reader.lines();
        let first = lines
            .next()
            .ok_or_else(|| RecordingError::Format("empty recording".into()))??;
        let header: RecordingHeader = serde_json::from_str(&first)
            .map_err(|e| RecordingError::Format(format!("bad header: {e}")))?;
        if header.version != 2 {
            return Err(RecordingError::Format(format!(
                "unsupported version {}",
                header.version
            )));
        }
        Ok(Self { header, lines })
    }

    pub fn header(&self) -> &RecordingHeader {
        &self.header
    }
}

impl<R: BufRead> Iterator for RecordingReader<R> {
    type Item = Result<RecordingEvent, RecordingError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(Into::into));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::EventKind;

    #[test]
    fn reads_plain_ndjson() {
        let text = "{\"version\":2,\"width\":80,\"height\":24,\"timestamp\":1}\n\n[0.1,\"o\",\"a\"]\n[0.2,\"i\",\"b\"]\n";
        let reader = RecordingReader::new(text.as_bytes()).unwrap();
        assert!(reader.header().env.is_empty());
        let events: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Input);
    }

    #[test]
    fn rejects_wrong_version() {
        let text = "{\"version\":1,\"width\":80,\"height\":24,\"timestamp\":1}\n";
        assert!(matches!(
            RecordingReader::new(text.as_bytes()),
            Err(RecordingError::Format(_))
        ));
    }

    #[test]
    fn rejects_empty() {
        assert!(RecordingReader::new("".as_bytes()).is_err());
    }

    #[test]
    fn bad_event_code_is_an_error() {
        let text = "{\"version\":2,\"width\":80,\"height\":24,\"timestamp\":1}\n[0.1,\"x\",\"a\"]\n";
        let mut reader = RecordingReader::new(text.as_bytes()).unwrap();
        assert!(reader.next().unwrap().is_err());
    }
}
