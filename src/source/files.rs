use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::constants::files::{
    DEFAULT_JSON_TEXT_KEY, GZIP_EXTENSIONS, JSONL_EXTENSIONS, TEXT_EXTENSIONS, ZSTD_EXTENSIONS,
};
use crate::errors::PipelineError;
use crate::source::{DocumentStream, unavailable};
use crate::types::{DocumentText, StreamName};

/// Lazily decoded documents of one opened file.
pub type DocumentReader = Box<dyn Iterator<Item = Result<DocumentText, PipelineError>> + Send>;

/// Buffered, already decompressed contents of one corpus file.
pub type DocumentInput = Box<dyn BufRead + Send>;

/// Turns an opened file into a document iterator.
pub type FormatHandler =
    Arc<dyn Fn(&Path, DocumentInput) -> Result<DocumentReader, PipelineError> + Send + Sync>;

/// Wraps a compressed file in a decoding reader.
pub type Decompressor = Arc<dyn Fn(File) -> io::Result<Box<dyn Read + Send>> + Send + Sync>;

/// Extension to format-handler mapping, plus the compression extensions that
/// may wrap a format (`docs.jsonl.gz`).
///
/// Built once and shared by reference; there is no process-wide registry.
#[derive(Clone, Default)]
pub struct FormatRegistry {
    handlers: HashMap<String, FormatHandler>,
    decompressors: HashMap<String, Decompressor>,
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut extensions: Vec<&String> = self.handlers.keys().collect();
        extensions.sort();
        let mut compressions: Vec<&String> = self.decompressors.keys().collect();
        compressions.sort();
        f.debug_struct("FormatRegistry")
            .field("extensions", &extensions)
            .field("compressions", &compressions)
            .finish()
    }
}

impl FormatRegistry {
    /// Registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// JSONL (`text` key) and plain-text handlers, each readable through
    /// gzip or zstd.
    pub fn with_defaults() -> Self {
        Self::with_json_text_key(DEFAULT_JSON_TEXT_KEY)
    }

    /// JSONL handlers reading `text_key`, plus plain-text handlers and the
    /// default decompressors.
    pub fn with_json_text_key(text_key: impl Into<String>) -> Self {
        let text_key = text_key.into();
        let mut registry = Self::empty();
        for ext in JSONL_EXTENSIONS {
            registry = registry.register(ext, jsonl_handler(text_key.clone()));
        }
        for ext in TEXT_EXTENSIONS {
            registry = registry.register(ext, Arc::new(whole_file_handler));
        }
        for ext in GZIP_EXTENSIONS {
            registry = registry.register_decompressor(ext, gzip_decompressor());
        }
        for ext in ZSTD_EXTENSIONS {
            registry = registry.register_decompressor(ext, zstd_decompressor());
        }
        registry
    }

    /// Add or replace the handler for `extension` (case-insensitive, no dot).
    pub fn register(mut self, extension: impl AsRef<str>, handler: FormatHandler) -> Self {
        let key = normalize_extension(extension.as_ref());
        self.handlers.insert(key, handler);
        self
    }

    /// Add or replace the decompressor for a compression `extension`.
    ///
    /// A file ending in that extension is decoded first, then handled by the
    /// format of the extension before it.
    pub fn register_decompressor(
        mut self,
        extension: impl AsRef<str>,
        decompressor: Decompressor,
    ) -> Self {
        let key = normalize_extension(extension.as_ref());
        self.decompressors.insert(key, decompressor);
        self
    }

    /// Handler for `path`'s format, looking through a compression extension.
    pub fn handler_for(&self, path: &Path) -> Option<&FormatHandler> {
        self.resolve(path).map(|(handler, _)| handler)
    }

    fn resolve(&self, path: &Path) -> Option<(&FormatHandler, Option<&Decompressor>)> {
        let ext = normalize_extension(path.extension()?.to_str()?);
        match self.decompressors.get(&ext) {
            Some(decompressor) => {
                let inner = Path::new(path.file_stem()?).extension()?.to_str()?;
                let handler = self.handlers.get(&normalize_extension(inner))?;
                Some((handler, Some(decompressor)))
            }
            None => Some((self.handlers.get(&ext)?, None)),
        }
    }

    /// Returns `true` when `path` has a registered extension.
    pub fn supports(&self, path: &Path) -> bool {
        self.handler_for(path).is_some()
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

fn gzip_decompressor() -> Decompressor {
    Arc::new(|file: File| {
        Ok::<_, io::Error>(Box::new(MultiGzDecoder::new(file)) as Box<dyn Read + Send>)
    })
}

fn zstd_decompressor() -> Decompressor {
    Arc::new(|file: File| {
        let decoder = zstd::stream::read::Decoder::new(file)?;
        Ok::<_, io::Error>(Box::new(decoder) as Box<dyn Read + Send>)
    })
}

fn jsonl_handler(text_key: String) -> FormatHandler {
    Arc::new(move |path: &Path, reader: DocumentInput| {
        let key = text_key.clone();
        let origin = path.display().to_string();
        let docs = reader
            .lines()
            .enumerate()
            .filter_map(move |(idx, line)| match line {
                Err(err) => Some(Err(unavailable(
                    origin.clone(),
                    format!("line {}: {err}", idx + 1),
                ))),
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(text_from_json_line(&line, &key).map_err(|reason| {
                    unavailable(origin.clone(), format!("line {}: {reason}", idx + 1))
                })),
            });
        Ok::<_, PipelineError>(Box::new(docs) as DocumentReader)
    })
}

fn text_from_json_line(line: &str, key: &str) -> Result<DocumentText, String> {
    let value: Value = serde_json::from_str(line).map_err(|err| err.to_string())?;
    match value.get(key) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(other) => Err(format!("field '{key}' is not a string: {other}")),
        None => Err(format!("missing field '{key}'")),
    }
}

fn whole_file_handler(
    path: &Path,
    mut reader: DocumentInput,
) -> Result<DocumentReader, PipelineError> {
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .map_err(|err| unavailable(path.display().to_string(), err.to_string()))?;
    Ok(Box::new(std::iter::once(Ok(text))))
}

/// Document stream over a fixed, ordered list of corpus files.
///
/// Files are opened one at a time; `restart` rewinds to the first file.
pub struct FileDocumentStream {
    name: StreamName,
    paths: Vec<PathBuf>,
    registry: Arc<FormatRegistry>,
    next_path: usize,
    current: Option<DocumentReader>,
}

impl FileDocumentStream {
    /// Stream every supported file under `root`, in sorted path order.
    ///
    /// Files whose extension has no handler are skipped; compressed files
    /// count when the registry knows both the compression and the format.
    pub fn from_root(
        name: impl Into<StreamName>,
        root: impl AsRef<Path>,
        registry: Arc<FormatRegistry>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let root = root.as_ref();
        if !root.exists() {
            return Err(unavailable(
                name,
                format!("corpus root {} does not exist", root.display()),
            ));
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(|err| unavailable(name.clone(), err.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if registry.supports(entry.path()) {
                paths.push(entry.into_path());
            } else {
                debug!(
                    stream = %name,
                    path = %entry.path().display(),
                    "skipping unsupported corpus file"
                );
            }
        }
        paths.sort();
        debug!(stream = %name, files = paths.len(), "indexed corpus root");
        Ok(Self::with_paths(name, paths, registry))
    }

    /// Stream an explicit list of files, in the given order.
    pub fn from_paths<I, P>(
        name: impl Into<StreamName>,
        paths: I,
        registry: Arc<FormatRegistry>,
    ) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let name = name.into();
        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        if let Some(path) = paths.iter().find(|path| !registry.supports(path)) {
            return Err(PipelineError::Configuration(format!(
                "unsupported file type for {} in stream '{name}'",
                path.display()
            )));
        }
        Ok(Self::with_paths(name, paths, registry))
    }

    fn with_paths(name: StreamName, paths: Vec<PathBuf>, registry: Arc<FormatRegistry>) -> Self {
        Self {
            name,
            paths,
            registry,
            next_path: 0,
            current: None,
        }
    }

    /// Stream name used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Files in read order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn open_next(&mut self) -> Result<bool, PipelineError> {
        let Some(path) = self.paths.get(self.next_path) else {
            return Ok(false);
        };
        self.next_path += 1;
        let (handler, decompressor) = self.registry.resolve(path).ok_or_else(|| {
            PipelineError::Configuration(format!("unsupported file type for {}", path.display()))
        })?;
        let file = File::open(path).map_err(|err| {
            unavailable(
                self.name.clone(),
                format!("failed opening {}: {err}", path.display()),
            )
        })?;
        let input: Box<dyn Read + Send> = match decompressor {
            Some(decompress) => decompress(file).map_err(|err| {
                unavailable(
                    self.name.clone(),
                    format!("failed decompressing {}: {err}", path.display()),
                )
            })?,
            None => Box::new(file),
        };
        debug!(
            stream = %self.name,
            path = %path.display(),
            compressed = decompressor.is_some(),
            "opened corpus file"
        );
        self.current = Some(handler(path, Box::new(BufReader::new(input)))?);
        Ok(true)
    }
}

impl DocumentStream for FileDocumentStream {
    type Item = DocumentText;

    fn next_item(&mut self) -> Result<Option<DocumentText>, PipelineError> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                match reader.next() {
                    Some(doc) => return doc.map(Some),
                    None => self.current = None,
                }
            }
            if !self.open_next()? {
                return Ok(None);
            }
        }
    }

    fn can_restart(&self) -> bool {
        true
    }

    fn restart(&mut self) -> Result<(), PipelineError> {
        self.next_path = 0;
        self.current = None;
        Ok(())
    }
}
