//! Streaming reader for registry XML dumps
//!
//! Dump files hold one root element with millions of self-closing record
//! elements, e.g. `<Object AOGUID="..." FORMALNAME="..." .../>`. The reader
//! pulls one event at a time from a buffered file, so memory stays bounded by
//! a single element no matter how large the file is.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::fs::File;
use std::io::BufReader;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::progress::ImportProgress;
use super::source::{ImportError, IngestStats, XmlRecord};
use crate::index::writer::WriterMsg;
use crate::types::Document;

/// Reader errors in a row after which the rest of the file is abandoned
const MAX_CONSECUTIVE_ERRORS: usize = 64;

/// Streaming source of records of type `R`
pub struct FiasXmlSource<R: XmlRecord> {
    path: PathBuf,
    reader: Reader<BufReader<File>>,
    buf: Vec<u8>,
    tag: String,
    consecutive_errors: usize,
    finished: bool,
    _record: PhantomData<R>,
}

impl<R: XmlRecord> FiasXmlSource<R> {
    /// Open a dump file for the record type's default tag
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let buf_reader = BufReader::with_capacity(1024 * 1024, file); // 1MB buffer
        let reader = Reader::from_reader(buf_reader);

        Ok(Self {
            path,
            reader,
            buf: Vec::with_capacity(4096),
            tag: R::TAG.to_string(),
            consecutive_errors: 0,
            finished: false,
            _record: PhantomData,
        })
    }

    /// Match records on a different element tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn source_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("registry dump")
    }

    fn decode(element: &BytesStart<'_>, tag: &str) -> Result<R, ImportError> {
        let mut record = R::default();
        for attr in element.attributes() {
            let attr = attr.map_err(|e| ImportError::Parse(e.to_string()))?;
            let name = std::str::from_utf8(attr.key.as_ref())
                .map_err(|e| ImportError::Parse(e.to_string()))?
                .to_string();
            let value = attr.unescape_value()?.into_owned();
            record.set_attribute(&name, value);
        }
        if record.key().is_empty() {
            return Err(ImportError::Parse(format!(
                "<{}> element without identifier",
                tag
            )));
        }
        Ok(record)
    }

    /// Read up to the next matching element. `None` at end of file.
    fn next_record(&mut self) -> Option<Result<R, ImportError>> {
        loop {
            if self.finished {
                return None;
            }

            self.buf.clear();
            let decoded = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                    if e.name().as_ref() == self.tag.as_bytes() =>
                {
                    Some(Self::decode(e, &self.tag))
                }
                Ok(Event::Eof) => {
                    self.finished = true;
                    None
                }
                Ok(_) => continue,
                Err(e) => {
                    self.consecutive_errors += 1;
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        warn!(
                            "Abandoning {} after {} consecutive read errors",
                            self.path.display(),
                            self.consecutive_errors
                        );
                        self.finished = true;
                    }
                    Some(Err(ImportError::from(e)))
                }
            };

            if let Some(Ok(_)) = decoded {
                self.consecutive_errors = 0;
            }
            return decoded;
        }
    }
}

impl<R: XmlRecord> Iterator for FiasXmlSource<R> {
    type Item = Result<R, ImportError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

/// Stream one file into the writer channel.
///
/// Blocking: run it on a blocking thread. A file that cannot be opened
/// contributes zero records and is reported as an error for the caller to
/// log; malformed elements are skipped and counted.
pub fn ingest_file<R>(
    path: &Path,
    tx: &mpsc::Sender<WriterMsg<R>>,
    progress: &ImportProgress,
) -> Result<IngestStats, ImportError>
where
    R: XmlRecord + Document,
{
    let source = FiasXmlSource::<R>::open(path)?;
    info!("Streaming <{}> records from {}", R::TAG, source.source_name());

    let mut stats = IngestStats::default();
    for result in source {
        if progress.is_cancelled() {
            info!("Import of {} cancelled", path.display());
            break;
        }
        match result {
            Ok(record) => {
                tx.blocking_send(WriterMsg::Record(record))
                    .map_err(|_| ImportError::ChannelClosed("writer stopped"))?;
                stats.records += 1;
                progress.record_processed();
            }
            Err(e) => {
                debug!("Skipping malformed element in {}: {}", path.display(), e);
                stats.skipped += 1;
                progress.record_error();
            }
        }
    }

    info!(
        "Finished {}: {} records, {} skipped",
        path.display(),
        stats.records,
        stats.skipped
    );
    Ok(stats)
}
