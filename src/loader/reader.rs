use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::{Stream, stream};
use snafu::ResultExt;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};

use super::{LoadError, OpenInputSnafu, ReadInputSnafu};
use crate::{
    adaptive_concurrency::internal_event::{DocumentDropped, InternalEvent},
    store::{CollectionRef, Document},
};

/// An ordered group of documents bound for one collection.
#[derive(Clone, Debug)]
pub struct Batch {
    pub collection: Arc<CollectionRef>,
    /// Position of the batch within its input file, starting at 0.
    pub sequence: usize,
    pub documents: Vec<Document>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Returns the document text of `line` if it holds a complete single-line object.
///
/// The input files are pretty-printed JSON arrays with one element per line, so
/// a line is a document when, trimmed and without one trailing comma, it starts
/// with `{` and ends with `}`. Objects spread over several lines never match.
pub fn accept_line(line: &str) -> Option<&str> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let line = line.strip_suffix(',').unwrap_or(line);
    line.ends_with('}').then_some(line)
}

/// Reads one input file as a lazy sequence of batches.
///
/// Lines are decoded lossily, so bytes that are not UTF-8 only ever cost the
/// document they appear in. A leading byte order mark is ignored.
pub struct BatchReader {
    input: BufReader<File>,
    buffer: Vec<u8>,
    path: PathBuf,
    collection: Arc<CollectionRef>,
    batch_size: usize,
    line_number: usize,
    sequence: usize,
    done: bool,
}

impl BatchReader {
    pub async fn open(
        path: impl AsRef<Path>,
        collection: Arc<CollectionRef>,
        batch_size: usize,
    ) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await.context(OpenInputSnafu { path: &path })?;
        Ok(Self {
            input: BufReader::new(file),
            buffer: Vec::new(),
            path,
            collection,
            batch_size: batch_size.max(1),
            line_number: 0,
            sequence: 0,
            done: false,
        })
    }

    /// The next full batch, the final partial batch, or `None` at end of input.
    pub async fn next_batch(&mut self) -> Result<Option<Batch>, LoadError> {
        if self.done {
            return Ok(None);
        }

        let mut documents = Vec::with_capacity(self.batch_size);
        while documents.len() < self.batch_size {
            self.buffer.clear();
            let read = self
                .input
                .read_until(b'\n', &mut self.buffer)
                .await
                .context(ReadInputSnafu { path: &self.path })?;
            if read == 0 {
                self.done = true;
                break;
            }
            self.line_number += 1;

            let decoded = String::from_utf8_lossy(&self.buffer);
            let mut line: &str = &decoded;
            if self.line_number == 1 {
                line = line.trim_start_matches('\u{feff}');
            }
            let Some(text) = accept_line(line) else {
                continue;
            };
            match serde_json::from_str::<Document>(text) {
                Ok(document) => documents.push(document),
                Err(error) => DocumentDropped {
                    line_number: self.line_number,
                    error: &error,
                }
                .emit(),
            }
        }

        if documents.is_empty() {
            return Ok(None);
        }
        let batch = Batch {
            collection: Arc::clone(&self.collection),
            sequence: self.sequence,
            documents,
        };
        self.sequence += 1;
        Ok(Some(batch))
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Batch, LoadError>> {
        stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_batch().await?.map(|batch| (batch, reader)))
        })
    }
}
