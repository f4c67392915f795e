use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use warden_process::FailureKind;

/// How much of the log end is scanned when a launch fails.
const TAIL_SCAN_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn tag(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

static ANSI_ESCAPE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
        .expect("hard-coded regular expression to be valid")
});

pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE_REGEX.replace_all(line, "").into_owned()
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

pub(crate) fn format_line(tag: &str, line: &str) -> String {
    format!("[{}] [{tag}] {}", timestamp(), strip_ansi(line.trim_end_matches('\r')))
}

/// `<log_dir>/<id>-<YYYYmmdd-HHMMSS>.log`
pub fn log_file_path(log_dir: &Path, component_id: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    log_dir.join(format!("{component_id}-{stamp}.log"))
}

enum LogMsg {
    Line(String),
    Flush(oneshot::Sender<()>),
}

struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        for i in (1..self.max_files).rev() {
            let from = PathBuf::from(format!("{}.{}", self.path.display(), i));
            let to = PathBuf::from(format!("{}.{}", self.path.display(), i + 1));
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(from, to).await;
            }
        }

        let rotated = PathBuf::from(format!("{}.1", self.path.display()));
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, &rotated).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write_len = line.len() as u64;
        if self.max_bytes > 0 && self.bytes.saturating_add(write_len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }
}

/// Console capture for one launched component: one writer task owns the file, any number of
/// reader tasks feed it lines.
#[derive(Debug)]
pub struct ConsoleLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<LogMsg>,
}

impl std::fmt::Debug for LogMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogMsg::Line(l) => f.debug_tuple("Line").field(l).finish(),
            LogMsg::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl ConsoleLog {
    pub async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        let mut writer = FileLogWriter::open(path.clone(), max_bytes, max_files).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMsg>();
        let log_path = path.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    LogMsg::Line(line) => {
                        if let Err(e) = writer.write_line(&line).await {
                            tracing::warn!(path = %log_path.display(), error = %e, "console log write failed");
                        }
                        if rx.is_empty() {
                            let _ = writer.file.flush().await;
                        }
                    }
                    LogMsg::Flush(done) => {
                        let _ = writer.file.flush().await;
                        let _ = done.send(());
                    }
                }
            }
            let _ = writer.file.flush().await;
        });
        Ok(Self { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Orchestrator-side annotation, tagged `[warden]`.
    pub fn note(&self, line: impl AsRef<str>) {
        let _ = self.tx.send(LogMsg::Line(format_line("warden", line.as_ref())));
    }

    /// Drains `reader` line by line until EOF. Resolves to the number of lines captured.
    pub fn attach<R>(&self, stream: Stream, reader: R) -> JoinHandle<u64>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut count = 0u64;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        count += 1;
                        if tx.send(LogMsg::Line(format_line(stream.tag(), &line))).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Non-UTF-8 output ends line framing; note it and stop reading.
                        let _ = tx.send(LogMsg::Line(format_line(
                            stream.tag(),
                            &format!("<unreadable output: {e}>"),
                        )));
                        break;
                    }
                }
            }
            count
        })
    }

    /// Resolves once every line queued before this call is on disk.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogMsg::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Last `max_lines` lines of a log file. Missing or unreadable files yield nothing.
pub async fn read_tail(path: &Path, max_lines: usize) -> Vec<String> {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return Vec::new();
    };
    let len = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(TAIL_SCAN_BYTES);
    if start > 0 && file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
        return Vec::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).await.is_err() {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    // A partial first line after seeking is noise.
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(max_lines);
    lines[skip..].iter().map(|l| l.to_string()).collect()
}

/// Maps the tail of a crashed component's output to a failure category.
pub fn classify_failure<S: AsRef<str>>(lines: &[S]) -> FailureKind {
    let mut saw_permission = false;
    let mut saw_port = false;
    for line in lines.iter().rev() {
        let l = line.as_ref().to_ascii_lowercase();
        if l.contains("modulenotfounderror")
            || l.contains("no module named")
            || l.contains("importerror")
            || l.contains("cannot find module")
            || l.contains("command not found")
            || l.contains("error while loading shared libraries")
        {
            return FailureKind::MissingDependency;
        }
        if l.contains("permission denied") || l.contains("operation not permitted") || l.contains("eacces") {
            saw_permission = true;
        }
        if l.contains("address already in use") || l.contains("eaddrinuse") || l.contains("port is already allocated") {
            saw_port = true;
        }
    }
    if saw_port {
        FailureKind::PortInUse
    } else if saw_permission {
        FailureKind::PermissionDenied
    } else {
        FailureKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ansi_sequences_are_removed() {
        assert_eq!(strip_ansi("\x1b[32mINFO\x1b[0m ready"), "INFO ready");
        assert_eq!(strip_ansi("\x1b]0;title\x07plain"), "plain");
        assert_eq!(strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn formatted_lines_carry_stream_tag() {
        let line = format_line("stderr", "\x1b[31mboom\x1b[0m\r");
        assert!(line.ends_with("[stderr] boom"));
        assert!(line.starts_with('['));
    }

    #[test]
    fn log_paths_embed_component_and_timestamp() {
        let p = log_file_path(Path::new("/var/log/warden"), "vector-store");
        let name = p.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("vector-store-"));
        assert!(name.ends_with(".log"));
        // vector-store-YYYYmmdd-HHMMSS.log
        assert_eq!(name.len(), "vector-store-".len() + 15 + ".log".len());
    }

    #[test]
    fn failure_classification() {
        assert_eq!(
            classify_failure(&["Traceback", "ModuleNotFoundError: No module named 'fastapi'"]),
            FailureKind::MissingDependency
        );
        assert_eq!(
            classify_failure(&["OSError: [Errno 98] Address already in use"]),
            FailureKind::PortInUse
        );
        assert_eq!(
            classify_failure(&["open /data/db: permission denied"]),
            FailureKind::PermissionDenied
        );
        assert_eq!(classify_failure(&["segfault"]), FailureKind::Unknown);
        let empty: [&str; 0] = [];
        assert_eq!(classify_failure(&empty), FailureKind::Unknown);
    }

    #[tokio::test]
    async fn captures_both_streams_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("svc.log");
        let log = ConsoleLog::open(path.clone(), 0, 1).await.unwrap();

        log.note("spawning svc");
        let out = log.attach(Stream::Stdout, &b"hello\n\x1b[1mworld\x1b[0m\n"[..]);
        assert_eq!(out.await.unwrap(), 2);
        let err = log.attach(Stream::Stderr, &b"oops\n"[..]);
        assert_eq!(err.await.unwrap(), 1);
        log.flush().await;

        let tail = read_tail(&path, 10).await;
        assert_eq!(tail.len(), 4);
        assert!(tail[0].ends_with("[warden] spawning svc"));
        assert!(tail[1].ends_with("[stdout] hello"));
        assert!(tail[2].ends_with("[stdout] world"));
        assert!(tail[3].ends_with("[stderr] oops"));
    }

    #[tokio::test]
    async fn rotation_keeps_bounded_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.log");
        let log = ConsoleLog::open(path.clone(), 200, 2).await.unwrap();
        for i in 0..40 {
            log.note(format!("line {i}"));
        }
        log.flush().await;

        assert!(tokio::fs::metadata(format!("{}.1", path.display())).await.is_ok());
        assert!(tokio::fs::metadata(format!("{}.3", path.display())).await.is_err());
        let current = tokio::fs::metadata(&path).await.unwrap().len();
        assert!(current <= 200);
    }

    #[tokio::test]
    async fn tail_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_tail(&dir.path().join("nope.log"), 5).await.is_empty());
    }
}
