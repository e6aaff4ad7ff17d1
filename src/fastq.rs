use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;

use crate::error::FileReadErrorKind;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqFormat {
    Fastq,
    Fasta,
}

/// One parsed FASTQ/FASTA record. Qualities are validated but not kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqRecord {
    pub id: String,
    pub seq: Vec<u8>,
}

/// Streaming FASTQ/FASTA parser over plain or gzip-compressed input.
///
/// The format is taken from the first byte of the decompressed stream
/// (`@` or `>`); gzip is recognised by its magic bytes, not the file name.
pub struct RecordReader {
    reader: Box<dyn BufRead + Send>,
    compressed: bool,
    format: Option<SeqFormat>,
    line: Vec<u8>,
    /// FASTA header already consumed while reading the previous record.
    pending_header: Option<String>,
    records: u64,
    finished: bool,
}

impl RecordReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FileReadErrorKind> {
        let file = File::open(path.as_ref()).map_err(FileReadErrorKind::Open)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read + Send + 'static>(inner: R) -> Result<Self, FileReadErrorKind> {
        let mut buffered = BufReader::new(inner);
        let head = buffered.fill_buf().map_err(FileReadErrorKind::Io)?;
        let compressed = head.starts_with(&GZIP_MAGIC);

        let reader: Box<dyn BufRead + Send> = if compressed {
            Box::new(BufReader::new(MultiGzDecoder::new(buffered)))
        } else {
            Box::new(buffered)
        };

        Ok(Self {
            reader,
            compressed,
            format: None,
            line: Vec::with_capacity(256),
            pending_header: None,
            records: 0,
            finished: false,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Detected format, known once the first record has been requested.
    pub fn format(&self) -> Option<SeqFormat> {
        self.format
    }

    /// Records returned so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    fn io_error(&self, e: io::Error) -> FileReadErrorKind {
        if self.compressed {
            FileReadErrorKind::Decompression(e.to_string())
        } else {
            FileReadErrorKind::Io(e)
        }
    }

    /// Reads one line into `self.line` without its line terminator.
    /// Returns `false` at end of input.
    fn next_line(&mut self) -> Result<bool, FileReadErrorKind> {
        self.line.clear();
        let n = match self.reader.read_until(b'\n', &mut self.line) {
            Ok(n) => n,
            Err(e) => return Err(self.io_error(e)),
        };
        while matches!(self.line.last(), Some(b'\n' | b'\r')) {
            self.line.pop();
        }
        Ok(n > 0)
    }

    /// Next non-blank line, or `false` at end of input.
    fn next_content_line(&mut self) -> Result<bool, FileReadErrorKind> {
        while self.next_line()? {
            if !self.line.iter().all(u8::is_ascii_whitespace) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn header_id(&self) -> String {
        let header = &self.line[1..];
        let end = header
            .iter()
            .position(u8::is_ascii_whitespace)
            .unwrap_or(header.len());
        String::from_utf8_lossy(&header[..end]).into_owned()
    }

    fn malformed(&self, reason: impl Into<String>) -> FileReadErrorKind {
        FileReadErrorKind::Malformed {
            record: self.records + 1,
            reason: reason.into(),
        }
    }

    pub fn next_record(&mut self) -> Result<Option<SeqRecord>, FileReadErrorKind> {
        if self.finished {
            return Ok(None);
        }
        let format = match self.format {
            Some(f) => f,
            None => {
                if !self.next_content_line()? {
                    self.finished = true;
                    return Ok(None);
                }
                let f = match self.line[0] {
                    b'@' => SeqFormat::Fastq,
                    b'>' => SeqFormat::Fasta,
                    _ => return Err(self.malformed("input is neither FASTQ nor FASTA")),
                };
                self.format = Some(f);
                if f == SeqFormat::Fasta {
                    self.pending_header = Some(self.header_id());
                } else {
                    // header line is consumed below
                    return self.fastq_record(true).map(|r| self.count(r));
                }
                f
            }
        };
        let record = match format {
            SeqFormat::Fastq => self.fastq_record(false)?,
            SeqFormat::Fasta => self.fasta_record()?,
        };
        Ok(self.count(record))
    }

    fn count(&mut self, record: Option<SeqRecord>) -> Option<SeqRecord> {
        match record {
            Some(r) => {
                self.records += 1;
                Some(r)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    fn fastq_record(&mut self, header_in_line: bool) -> Result<Option<SeqRecord>, FileReadErrorKind> {
        if !header_in_line && !self.next_content_line()? {
            return Ok(None);
        }
        if self.line.first() != Some(&b'@') {
            return Err(self.malformed("FASTQ header must start with '@'"));
        }
        let id = self.header_id();
        let truncated = FileReadErrorKind::Truncated {
            record: self.records + 1,
        };

        if !self.next_line()? {
            return Err(truncated);
        }
        let seq = self.line.clone();

        if !self.next_line()? {
            return Err(truncated);
        }
        if self.line.first() != Some(&b'+') {
            return Err(self.malformed("missing '+' separator line"));
        }

        if !self.next_line()? {
            return Err(truncated);
        }
        if self.line.len() != seq.len() {
            return Err(self.malformed(format!(
                "quality length {} differs from sequence length {}",
                self.line.len(),
                seq.len()
            )));
        }
        Ok(Some(SeqRecord { id, seq }))
    }

    fn fasta_record(&mut self) -> Result<Option<SeqRecord>, FileReadErrorKind> {
        let id = match self.pending_header.take() {
            Some(id) => id,
            None => {
                if !self.next_content_line()? {
                    return Ok(None);
                }
                if self.line[0] != b'>' {
                    return Err(self.malformed("FASTA header must start with '>'"));
                }
                self.header_id()
            }
        };

        let mut seq = Vec::new();
        while self.next_line()? {
            if self.line.first() == Some(&b'>') {
                self.pending_header = Some(self.header_id());
                break;
            }
            seq.extend(self.line.iter().filter(|b| !b.is_ascii_whitespace()));
        }
        Ok(Some(SeqRecord { id, seq }))
    }
}

impl Iterator for RecordReader {
    type Item = Result<SeqRecord, FileReadErrorKind>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(r)) => Some(Ok(r)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
