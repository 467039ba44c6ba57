//! Sequential suppliers of documents.
//!
//! The input format is a header line holding the decimal document count followed by
//! one JSON document per line.

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};

use crate::document::Document;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SourceError {
    #[snafu(display("Failed to open input file {}: {source}", path.display()))]
    Open { path: PathBuf, source: io::Error },

    #[snafu(display("Input has no header line with the document count"))]
    MissingHeader,

    #[snafu(display("Invalid document count in header: {header:?}"))]
    InvalidHeader {
        header: String,
        source: std::num::ParseIntError,
    },

    #[snafu(display("Failed to read input: {source}"))]
    Read { source: io::Error },

    #[snafu(display("Line {line} is not a valid JSON document: {source}"))]
    MalformedDocument {
        line: u64,
        source: serde_json::Error,
    },
}

/// A single-consumer supplier of documents with a total known up front.
pub trait DocumentSource {
    /// Number of documents the source announced at load time.
    fn total(&self) -> u64;

    /// Next document, or `None` once the sequence is exhausted.
    fn next_document(&mut self) -> Result<Option<Document>, SourceError>;
}

/// Reads the header-plus-JSON-lines input format.
///
/// Yields at most `total` documents. Trailing documents beyond the announced count are
/// ignored.
#[derive(Debug)]
pub struct JsonLinesSource<R> {
    reader: R,
    total: u64,
    yielded: u64,
    line_number: u64,
    exhausted: bool,
    buf: String,
}

impl JsonLinesSource<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).context(OpenSnafu { path })?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn from_reader(mut reader: R) -> Result<Self, SourceError> {
        let mut header = String::new();
        let read = reader.read_line(&mut header).context(ReadSnafu)?;
        if read == 0 {
            return MissingHeaderSnafu.fail();
        }
        let header = header.trim();
        let total = header
            .parse::<u64>()
            .context(InvalidHeaderSnafu { header })?;

        debug!(target: "adaptive_import::source", total, "Read input header");
        Ok(Self {
            reader,
            total,
            yielded: 0,
            line_number: 1,
            exhausted: false,
            buf: String::new(),
        })
    }

    /// Loads the next non-blank line into `buf`; `false` at end of input.
    fn advance_line(&mut self) -> Result<bool, SourceError> {
        loop {
            self.buf.clear();
            if self.reader.read_line(&mut self.buf).context(ReadSnafu)? == 0 {
                return Ok(false);
            }
            self.line_number += 1;
            if !self.buf.trim().is_empty() {
                return Ok(true);
            }
        }
    }
}

impl<R: BufRead> DocumentSource for JsonLinesSource<R> {
    fn total(&self) -> u64 {
        self.total
    }

    fn next_document(&mut self) -> Result<Option<Document>, SourceError> {
        if self.exhausted {
            return Ok(None);
        }

        if self.yielded == self.total {
            self.exhausted = true;
            if self.advance_line()? {
                warn!(
                    target: "adaptive_import::source",
                    total = self.total,
                    line = self.line_number,
                    "Input holds more documents than its header announces; ignoring the remainder."
                );
            }
            return Ok(None);
        }

        let sequence = self.yielded;
        if !self.advance_line()? {
            self.exhausted = true;
            return Ok(None);
        }
        let document = Document::from_json_line(sequence, self.buf.trim()).context(
            MalformedDocumentSnafu {
                line: self.line_number,
            },
        )?;
        self.yielded += 1;
        Ok(Some(document))
    }
}

/// In-memory source, mostly useful for embedding and tests.
#[derive(Clone, Debug, Default)]
pub struct VecSource {
    total: u64,
    documents: VecDeque<Document>,
}

impl VecSource {
    pub fn new(documents: impl IntoIterator<Item = Document>) -> Self {
        let documents: VecDeque<_> = documents.into_iter().collect();
        Self {
            total: documents.len() as u64,
            documents,
        }
    }

    /// Builds documents `{"id":"<prefix><n>"}` for `n` in `0..count`.
    pub fn numbered(prefix: &str, count: u64) -> Self {
        Self::new((0..count).map(|n| {
            let id = format!("{prefix}{n}");
            let body = serde_json::json!({ "id": id }).to_string();
            Document::new(n, Some(id), body)
        }))
    }
}

impl DocumentSource for VecSource {
    fn total(&self) -> u64 {
        self.total
    }

    fn next_document(&mut self) -> Result<Option<Document>, SourceError> {
        Ok(self.documents.pop_front())
    }
}

impl<T: DocumentSource + ?Sized> DocumentSource for Box<T> {
    fn total(&self) -> u64 {
        (**self).total()
    }

    fn next_document(&mut self) -> Result<Option<Document>, SourceError> {
        (**self).next_document()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn source(input: &str) -> Result<JsonLinesSource<Cursor<Vec<u8>>>, SourceError> {
        JsonLinesSource::from_reader(Cursor::new(input.as_bytes().to_vec()))
    }

    fn drain(source: &mut impl DocumentSource) -> Vec<Document> {
        let mut out = Vec::new();
        while let Some(doc) = source.next_document().unwrap() {
            out.push(doc);
        }
        out
    }

    #[test]
    fn reads_header_and_documents() {
        let mut src = source("2\n{\"id\":\"a\"}\n{\"id\":\"b\"}\n").unwrap();
        assert_eq!(src.total(), 2);

        let docs = drain(&mut src);
        let ids: Vec<_> = docs.iter().map(|d| d.id().unwrap()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(docs[1].sequence(), 1);

        // Stays exhausted.
        assert!(src.next_document().unwrap().is_none());
    }

    #[test]
    fn header_tolerates_whitespace_and_crlf() {
        let src = source(" 3 \r\n").unwrap();
        assert_eq!(src.total(), 3);
    }

    #[test]
    fn empty_input_has_no_header() {
        assert!(matches!(source(""), Err(SourceError::MissingHeader)));
    }

    #[test]
    fn non_numeric_header_is_rejected() {
        let err = source("lots\n{}\n").unwrap_err();
        assert!(matches!(err, SourceError::InvalidHeader { ref header, .. } if header == "lots"));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = JsonLinesSource::open("/definitely/not/here.jsonl").unwrap_err();
        assert!(matches!(err, SourceError::Open { .. }));
    }

    #[test]
    fn skips_blank_lines() {
        let mut src = source("2\n\n{\"id\":\"a\"}\n   \n{\"id\":\"b\"}\n").unwrap();
        assert_eq!(drain(&mut src).len(), 2);
    }

    #[test]
    fn caps_at_announced_total() {
        let mut src = source("1\n{\"id\":\"a\"}\n{\"id\":\"b\"}\n").unwrap();
        let docs = drain(&mut src);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id(), Some("a"));
    }

    #[test]
    fn ends_early_when_input_is_short() {
        let mut src = source("5\n{\"id\":\"a\"}\n").unwrap();
        assert_eq!(src.total(), 5);
        assert_eq!(drain(&mut src).len(), 1);
    }

    #[test]
    fn malformed_line_reports_its_line_number() {
        let mut src = source("2\n{\"id\":\"a\"}\n{oops\n").unwrap();
        assert!(src.next_document().unwrap().is_some());
        let err = src.next_document().unwrap_err();
        assert!(matches!(err, SourceError::MalformedDocument { line: 3, .. }));
    }

    #[test]
    fn numbered_vec_source() {
        let mut src = VecSource::numbered("doc-", 3);
        assert_eq!(src.total(), 3);
        let docs = drain(&mut src);
        assert_eq!(docs[2].id(), Some("doc-2"));
        assert_eq!(docs[2].json().unwrap()["id"], "doc-2");
    }
}
