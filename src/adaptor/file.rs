//! Newline-delimited JSON files and stdout.
//!
//! `file:///path/to/data.json` reads one JSON object per line as a source
//! and appends one per line as a sink. `stdout://` is sink-only.

use crate::adaptor::{
    construct, Adaptor, Client, Config, ReadContext, Reader, RecordSet, RecordStream, Session,
    WriteFn, Writer,
};
use crate::commitlog::Mode;
use crate::error::{AdaptorError, ErrorLevel, Result, ResultExt, TransitError};
use crate::message::{Document, Op, Record};
use crate::state::Identifier;
use serde::Deserialize;
use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DESCRIPTION: &str = "an adaptor that reads / writes files";

pub const SAMPLE_CONFIG: &str = r#"type = "file"
[config]
uri = "stdout://""#;

const FILE_SCHEME: &str = "file://";
const STDOUT_URI: &str = "stdout://";

#[derive(Debug, Deserialize)]
struct FileConfig {
    uri: String,
}

/// Where a file adaptor reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTarget {
    Stdout,
    Path(PathBuf),
}

impl FileTarget {
    pub fn parse(uri: &str) -> Result<Self> {
        if uri == STDOUT_URI {
            return Ok(FileTarget::Stdout);
        }
        match uri.strip_prefix(FILE_SCHEME) {
            Some(path) if !path.is_empty() => Ok(FileTarget::Path(PathBuf::from(path))),
            _ => Err(TransitError::Config(format!(
                "invalid file uri '{}', expected {}<path> or {}",
                uri, FILE_SCHEME, STDOUT_URI
            ))),
        }
    }
}

/// File adaptor.
#[derive(Debug, Clone)]
pub struct FileAdaptor {
    target: FileTarget,
}

impl FileAdaptor {
    pub fn new(target: FileTarget) -> Self {
        Self { target }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let conf: FileConfig = construct(config)?;
        Ok(Self::new(FileTarget::parse(&conf.uri)?))
    }
}

/// Open handle onto the target.
pub enum FileSession {
    Stdout(std::io::Stdout),
    File { path: PathBuf, file: File },
}

impl Session for FileSession {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn close(&mut self) {
        if let FileSession::File { path, file } = self {
            if let Err(e) = file.sync_data() {
                tracing::warn!(file = %path.display(), "Failed to sync: {}", e);
            }
        }
    }
}

impl Write for FileSession {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            FileSession::Stdout(out) => out.write(buf),
            FileSession::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            FileSession::Stdout(out) => out.flush(),
            FileSession::File { file, .. } => file.flush(),
        }
    }
}

impl Client for FileAdaptor {
    fn connect(&self) -> Result<Box<dyn Session>> {
        match &self.target {
            FileTarget::Stdout => Ok(Box::new(FileSession::Stdout(std::io::stdout()))),
            FileTarget::Path(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .append(true)
                    .create(true)
                    .open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                Ok(Box::new(FileSession::File {
                    path: path.clone(),
                    file,
                }))
            }
        }
    }
}

impl Reader for FileAdaptor {
    fn read(&self, mut ctx: ReadContext) -> Result<RecordStream> {
        let session = ctx
            .session
            .as_any_mut()
            .downcast_mut::<FileSession>()
            .ok_or_else(|| TransitError::Config("file reader needs a file session".into()))?;
        let (path, file) = match session {
            FileSession::File { path, file } => (path.clone(), file.try_clone()?),
            FileSession::Stdout(_) => {
                return Err(TransitError::FuncNotSupported {
                    name: STDOUT_URI.to_string(),
                    func: "Reader".to_string(),
                })
            }
        };
        let namespace = path.display().to_string();
        if !ctx.filter.matches(&namespace) {
            tracing::info!(file = %namespace, "File filtered by namespace, nothing to read");
            return Ok(Box::new(std::iter::empty()));
        }
        let stored = match ctx.state_for(&namespace).map(|s| &s.identifier) {
            Some(Identifier::Int(line)) => Some(*line),
            _ => None,
        };
        let logged = match ctx.resume_for(&namespace) {
            Some(point) => last_line_of(&path, &point.record.document)?,
            None => None,
        };
        let skip_through = stored.max(logged);

        let mut lines = BufReader::new(file).lines().enumerate();
        Ok(Box::new(std::iter::from_fn(move || loop {
            if ctx.is_done() {
                return None;
            }
            let Some((index, line)) = lines.next() else {
                tracing::info!(file = %namespace, "Read completed");
                return None;
            };
            let position = index as i64;
            if skip_through.is_some_and(|done| position <= done) {
                continue;
            }
            let line = match line {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Document>(&line) {
                Ok(doc) => {
                    let record = Record::new(Op::Insert, namespace.clone(), doc);
                    return Some(Ok(RecordSet::new(record, Mode::Copy, Identifier::Int(position))));
                }
                Err(e) => {
                    tracing::error!(file = %namespace, line = index + 1, "Can't unmarshal document ({})", e);
                }
            }
        })))
    }
}

/// Index of the last line holding `document`.
fn last_line_of(path: &Path, document: &Document) -> Result<Option<i64>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut last = None;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if serde_json::from_str::<Document>(&line).is_ok_and(|doc| doc == *document) {
            last = Some(index as i64);
        }
    }
    Ok(last)
}

/// Writes each record's document as one JSON line.
#[derive(Debug, Clone, Copy)]
pub struct FileWriter;

impl Writer for FileWriter {
    fn write(&self, record: Record) -> WriteFn {
        Box::new(move |session: &mut dyn Session| {
            let Some(out) = session.as_any_mut().downcast_mut::<FileSession>() else {
                return Err(AdaptorError::new(ErrorLevel::Critical, "", "file writer needs a file session").into());
            };
            let line = serde_json::to_string(&record.document)?;
            writeln!(out, "{}", line)
                .and_then(|_| out.flush())
                .map_err(|e| {
                    AdaptorError::new(ErrorLevel::Error, "", format!("write message error ({})", e))
                        .with_record(record.flatten())
                })?;
            Ok(record)
        })
    }
}

impl Adaptor for FileAdaptor {
    fn client(&self) -> Result<Arc<dyn Client>> {
        Ok(Arc::new(self.clone()))
    }

    fn reader(&self) -> Result<Arc<dyn Reader>> {
        Ok(Arc::new(self.clone()))
    }

    fn writer(&self) -> Result<Arc<dyn Writer>> {
        Ok(Arc::new(FileWriter))
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn sample_config(&self) -> &str {
        SAMPLE_CONFIG
    }
}
