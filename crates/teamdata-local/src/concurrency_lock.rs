use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use teamdata_core::{
    LockFailure, LockMessage, LockMessageHandler, Result, SyncError, LOCK_LOST_MESSAGE,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const MESSAGE_TIMEOUT: Duration = Duration::from_secs(4);
const LOCK_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const HOLDER_READ_ATTEMPTS: u32 = 5;
const HOLDER_READ_RETRY: Duration = Duration::from_millis(50);
const OPEN_ATTEMPTS: u32 = 3;

/// Extra validation run before a lock is taken (e.g. files are writable).
pub type LockApprover = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Contents of a lock file: who holds it and how to reach them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockFileInfo {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub extra_info: Option<String>,
}

impl LockFileInfo {
    fn parse(contents: &str) -> Self {
        // first line is intentionally blank
        let mut lines = contents.lines().skip(1);
        let host = lines.next().unwrap_or_default().trim().to_string();
        let port = lines
            .next()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(0);
        let token = lines.next().unwrap_or_default().trim().to_string();
        let extra: Vec<&str> = lines.collect();
        let extra_info = Some(extra.join("\n")).filter(|s| !s.trim().is_empty());
        Self {
            host,
            port,
            token,
            extra_info,
        }
    }

    fn render(&self) -> String {
        format!(
            "\n{}\n{}\n{}\n{}",
            self.host,
            self.port,
            self.token,
            self.extra_info.as_deref().unwrap_or_default()
        )
    }
}

pub(crate) fn local_host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

struct HeldLock {
    file: File,
    token: String,
    watcher: Option<LockWatcher>,
}

/// Exclusive lock implemented with an OS file lock on a lock file.
///
/// The lock file records the holder's host, a loopback port, a random token
/// and free-form extra info (typically the owner's name). When the holder
/// supplies a message handler, a listener on the loopback port answers
/// messages from processes that want the lock, and the lock file is
/// rechecked periodically so the handler hears about a lost lock.
pub struct FileConcurrencyLock {
    lock_file: PathBuf,
    approver: Option<LockApprover>,
    held: Mutex<Option<HeldLock>>,
}

impl std::fmt::Debug for FileConcurrencyLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileConcurrencyLock")
            .field("lock_file", &self.lock_file)
            .finish()
    }
}

impl FileConcurrencyLock {
    pub fn new(lock_file: impl Into<PathBuf>) -> Self {
        Self {
            lock_file: lock_file.into(),
            approver: None,
            held: Mutex::new(None),
        }
    }

    pub fn with_approver(mut self, approver: LockApprover) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub async fn is_held(&self) -> bool {
        self.held.lock().await.is_some()
    }

    /// Take the lock. Acquiring a lock this object already holds succeeds.
    ///
    /// On contention, `message` (if any) is relayed to the holder; a reply
    /// from the live holder turns the failure into `SentMessage`.
    #[instrument(skip(self, handler), level = "debug", fields(lock_file = %self.lock_file.display()))]
    pub async fn acquire(
        &self,
        message: Option<&str>,
        handler: Option<Arc<dyn LockMessageHandler>>,
        extra_info: Option<&str>,
    ) -> Result<()> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Ok(());
        }

        if let Some(approve) = &self.approver {
            approve()?;
        }

        let mut file = self.lock_current_file(message).await?;

        let token = Uuid::new_v4().to_string();
        let watcher = match handler {
            Some(handler) => {
                Some(LockWatcher::start(self.lock_file.clone(), token.clone(), handler).await?)
            }
            None => None,
        };

        let info = LockFileInfo {
            host: local_host_name(),
            port: watcher.as_ref().map_or(0, |w| w.port),
            token: token.clone(),
            extra_info: extra_info.map(str::to_string),
        };
        let written = file
            .set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(info.render().as_bytes()))
            .and_then(|_| file.sync_data());
        if let Err(e) = written {
            if let Some(w) = watcher {
                w.stop();
            }
            let _ = FileExt::unlock(&file);
            return Err(LockFailure::CannotCreate(format!(
                "Failed to write {}: {}",
                self.lock_file.display(),
                e
            ))
            .into());
        }

        *held = Some(HeldLock {
            file,
            token,
            watcher,
        });
        info!("Acquired lock {}", self.lock_file.display());
        Ok(())
    }

    /// Open and lock the file currently at the lock path.
    ///
    /// A releasing holder unlinks the file before unlocking it, so a lock won
    /// on a file that is no longer at the path is dropped and retried.
    async fn lock_current_file(&self, message: Option<&str>) -> Result<File> {
        for _ in 0..OPEN_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.lock_file)
                .map_err(|e| {
                    LockFailure::CannotCreate(format!("{}: {}", self.lock_file.display(), e))
                })?;

            if let Err(e) = file.try_lock_exclusive() {
                drop(file);
                if e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
                    || e.kind() == ErrorKind::WouldBlock
                {
                    return Err(self.contended(message).await);
                }
                return Err(LockFailure::CannotCreate(format!(
                    "{}: {}",
                    self.lock_file.display(),
                    e
                ))
                .into());
            }

            if is_file_at(&file, &self.lock_file) {
                return Ok(file);
            }
            debug!("Lock file {} was replaced, retrying", self.lock_file.display());
            let _ = FileExt::unlock(&file);
        }
        Err(LockFailure::CannotCreate(format!(
            "{} keeps changing",
            self.lock_file.display()
        ))
        .into())
    }

    /// The holder's lock info. A holder that has just taken the lock may not
    /// have written it yet, so empty contents are reread briefly.
    async fn read_holder(&self) -> LockFileInfo {
        for attempt in 1..=HOLDER_READ_ATTEMPTS {
            match std::fs::read_to_string(&self.lock_file) {
                Ok(contents) if !contents.trim().is_empty() => {
                    return LockFileInfo::parse(&contents)
                }
                Ok(_) if attempt < HOLDER_READ_ATTEMPTS => {
                    tokio::time::sleep(HOLDER_READ_RETRY).await
                }
                _ => break,
            }
        }
        LockFileInfo::default()
    }

    async fn contended(&self, message: Option<&str>) -> SyncError {
        let holder = self.read_holder().await;

        if let Some(message) = message {
            if holder.port > 0 && holder.host == local_host_name() {
                match send_message(holder.port, message).await {
                    Ok((token, response)) if token == holder.token => {
                        info!(
                            "Relayed lock message to holder of {}",
                            self.lock_file.display()
                        );
                        return LockFailure::SentMessage { response }.into();
                    }
                    Ok(_) => debug!("Lock port answered with a foreign token"),
                    Err(e) => debug!("Could not reach lock holder: {}", e),
                }
            }
        }

        LockFailure::AlreadyLocked {
            holder: holder.extra_info,
        }
        .into()
    }

    /// Confirm the lock is still ours.
    pub async fn assert_valid(&self) -> Result<()> {
        let held = self.held.lock().await;
        let Some(lock) = held.as_ref() else {
            return Err(LockFailure::NotLocked.into());
        };

        if let Some(parent) = self.lock_file.parent() {
            if !parent.is_dir() {
                return Err(LockFailure::Uncertain(format!(
                    "Directory {} is unavailable",
                    parent.display()
                ))
                .into());
            }
        }

        match std::fs::read_to_string(&self.lock_file) {
            Ok(contents) => {
                let info = LockFileInfo::parse(&contents);
                if info.token == lock.token {
                    Ok(())
                } else {
                    Err(LockFailure::AlreadyLocked {
                        holder: info.extra_info,
                    }
                    .into())
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(LockFailure::NotLocked.into()),
            Err(e) => Err(LockFailure::Uncertain(e.to_string()).into()),
        }
    }

    /// Release the lock and delete the lock file. Never fails.
    ///
    /// The file is unlinked while still locked; contenders that opened it
    /// earlier notice the replacement in `lock_current_file`.
    #[instrument(skip(self), level = "debug", fields(lock_file = %self.lock_file.display()))]
    pub async fn release(&self) {
        let Some(lock) = self.held.lock().await.take() else {
            return;
        };
        if let Some(watcher) = lock.watcher {
            watcher.stop();
        }
        if let Err(e) = std::fs::remove_file(&self.lock_file) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to delete lock file {}: {}", self.lock_file.display(), e);
            }
        }
        let _ = FileExt::unlock(&lock.file);
        info!("Released lock {}", self.lock_file.display());
    }

    /// Current contents of the lock file, if readable.
    pub fn holder_info(&self) -> Option<LockFileInfo> {
        read_lock_info(&self.lock_file)
    }
}

/// Whether `file` is still the file found at `path`.
#[cfg(unix)]
fn is_file_at(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(open), Ok(current)) => open.dev() == current.dev() && open.ino() == current.ino(),
        _ => false,
    }
}

/// Open files cannot be deleted here, so the path always holds the same file.
#[cfg(not(unix))]
fn is_file_at(_file: &File, path: &Path) -> bool {
    path.exists()
}

fn read_lock_info(path: &Path) -> Option<LockFileInfo> {
    std::fs::read_to_string(path)
        .ok()
        .map(|c| LockFileInfo::parse(&c))
}

/// Send a message to a lock holder; returns (holder token, response).
async fn send_message(port: u16, message: &str) -> std::io::Result<(String, Option<String>)> {
    let exchange = async {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
        stream
            .write_all(format!("{}\n", message.replace('\n', " ")).as_bytes())
            .await?;
        stream.shutdown().await?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok::<_, std::io::Error>(reply)
    };
    let reply = tokio::time::timeout(MESSAGE_TIMEOUT, exchange)
        .await
        .map_err(|_| std::io::Error::new(ErrorKind::TimedOut, "lock holder did not answer"))??;

    let (token, response) = reply.split_once('\n').unwrap_or((reply.as_str(), ""));
    let response = Some(response.trim_end().to_string()).filter(|r| !r.is_empty());
    Ok((token.trim().to_string(), response))
}

/// Background task answering lock messages and watching for lock loss.
struct LockWatcher {
    port: u16,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LockWatcher {
    async fn start(
        lock_file: PathBuf,
        token: String,
        handler: Arc<dyn LockMessageHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(|e| {
            SyncError::Io(format!("Failed to open lock message listener: {}", e))
        })?;
        let port = listener.local_addr()?.port();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let lock_source = lock_file.display().to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOCK_CHECK_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            answer_message(stream, &lock_source, &token, handler.as_ref()).await;
                        }
                        Err(e) => warn!("Lock listener accept failed: {}", e),
                    },
                    _ = ticker.tick() => {
                        let still_ours = read_lock_info(&lock_file)
                            .is_some_and(|info| info.token == token);
                        if !still_ours {
                            warn!("Lock {} was lost", lock_source);
                            handler.handle_message(&LockMessage::new(
                                lock_source.clone(),
                                LOCK_LOST_MESSAGE,
                            ));
                            break;
                        }
                    }
                }
            }
            debug!("Lock watcher for {} stopped", lock_source);
        });

        Ok(Self {
            port,
            shutdown,
            task,
        })
    }

    fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

async fn answer_message(
    stream: TcpStream,
    lock_source: &str,
    token: &str,
    handler: &dyn LockMessageHandler,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match tokio::time::timeout(MESSAGE_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(_)) => {}
        _ => return,
    }

    let message = LockMessage::new(lock_source, line.trim_end());
    let response = handler.handle_message(&message).unwrap_or_default();
    let mut stream = reader.into_inner();
    if let Err(e) = stream
        .write_all(format!("{}\n{}", token, response).as_bytes())
        .await
    {
        debug!("Failed to answer lock message: {}", e);
    }
    let _ = stream.shutdown().await;
}
