//! Supervision of an optional public tunnel in front of the gateway.
//!
//! Only `cloudflared` quick tunnels are supported. The child's stdout and stderr are merged line by
//! line, mirrored to a log file, and scanned for the public URL it announces.
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// cloudflared prints this, then the public URL on the following line.
const QUICK_TUNNEL_BANNER: &str = "Your quick Tunnel has been created! Visit it at";

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("failed to open tunnel log file {path}: {reason}")]
    LogFile { path: String, reason: String },

    #[error("tunnel process is not running")]
    NotRunning,

    #[error("tunnel process failed: {0}")]
    Process(#[from] std::io::Error),
}

/// A child process exposing the gateway publicly.
#[async_trait]
pub trait TunnelSupervisor: Send {
    /// Launches the tunnel and waits (bounded) for its public URL.
    async fn start(&mut self) -> Result<(), TunnelError>;

    /// Waits for the tunnel process to exit on its own.
    async fn wait(&mut self) -> Result<ExitStatus, TunnelError>;

    /// Kills the tunnel process. A tunnel that was never started is left alone.
    async fn terminate(&mut self) -> Result<(), TunnelError>;

    fn public_url(&self) -> Option<String>;
}

/// Launch options for [`CloudflaredTunnel`].
#[derive(Debug, Clone, bon::Builder)]
pub struct CloudflaredOptions {
    /// Local address the tunnel forwards to, e.g. `http://127.0.0.1:5000`.
    #[builder(into)]
    pub local_url: String,
    pub token: Option<String>,
    pub log_file: Option<PathBuf>,
    /// How long `start` waits for the public URL before carrying on without it.
    #[builder(default = Duration::from_secs(15))]
    pub url_timeout: Duration,
}

#[derive(Debug)]
pub struct CloudflaredTunnel {
    program: String,
    args: Vec<String>,
    options: CloudflaredOptions,
    child: Option<Child>,
    url: watch::Receiver<Option<String>>,
}

impl CloudflaredTunnel {
    pub fn new(options: CloudflaredOptions) -> Self {
        let mut args = vec!["tunnel".to_string()];
        if let Some(token) = &options.token {
            args.push("--token".to_string());
            args.push(token.clone());
        }
        args.push("--url".to_string());
        args.push(options.local_url.clone());
        Self::with_command("cloudflared", args, options)
    }

    /// Runs `program` instead of `cloudflared`.
    pub fn with_command(
        program: impl Into<String>,
        args: Vec<String>,
        options: CloudflaredOptions,
    ) -> Self {
        let (_, url) = watch::channel(None);
        Self {
            program: program.into(),
            args,
            options,
            child: None,
            url,
        }
    }

    async fn open_log_file(&self) -> Result<Option<tokio::fs::File>, TunnelError> {
        let Some(path) = &self.options.log_file else {
            return Ok(None);
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| TunnelError::LogFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(file))
    }
}

#[async_trait]
impl TunnelSupervisor for CloudflaredTunnel {
    async fn start(&mut self) -> Result<(), TunnelError> {
        let mut log_file = self.open_log_file().await?;

        debug!(program = %self.program, args = ?self.args, "Spawning tunnel");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::SpawnFailed {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx));
        }

        let (url_tx, url_rx) = watch::channel(None);
        self.url = url_rx.clone();
        tokio::spawn(async move {
            let mut scanner = TunnelUrlScanner::default();
            while let Some(line) = line_rx.recv().await {
                if let Some(file) = log_file.as_mut()
                    && let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await
                {
                    error!("Failed to write tunnel log: {}", e);
                    log_file = None;
                }
                if let Some(url) = scanner.observe(&line) {
                    url_tx.send_replace(Some(url));
                }
            }
            debug!("Tunnel output closed");
        });

        self.child = Some(child);

        let mut url_rx = url_rx;
        match tokio::time::timeout(
            self.options.url_timeout,
            url_rx.wait_for(|url| url.is_some()),
        )
        .await
        {
            Ok(Ok(url)) => info!("Tunnel available at {}", url.as_deref().unwrap_or_default()),
            _ => warn!("Tunnel started but no public URL was announced"),
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExitStatus, TunnelError> {
        let child = self.child.as_mut().ok_or(TunnelError::NotRunning)?;
        let status = child.wait().await?;
        info!(%status, "Tunnel process exited");
        Ok(status)
    }

    async fn terminate(&mut self) -> Result<(), TunnelError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            info!("Terminating tunnel");
            child.kill().await?;
        }
        Ok(())
    }

    fn public_url(&self) -> Option<String> {
        self.url.borrow().clone()
    }
}

async fn forward_lines<R>(reader: R, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if lines.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read tunnel output: {}", e);
                break;
            }
        }
    }
}

/// Finds the public URL in cloudflared's output, one line at a time.
#[derive(Debug, Default)]
pub struct TunnelUrlScanner {
    after_banner: bool,
}

impl TunnelUrlScanner {
    pub fn observe(&mut self, line: &str) -> Option<String> {
        if line.contains(QUICK_TUNNEL_BANNER) {
            self.after_banner = true;
            return None;
        }
        if !self.after_banner {
            return None;
        }
        self.after_banner = false;
        extract_tunnel_url(line)
    }
}

/// The first `http://` or `https://` token of `line`, minus a trailing `)`.
pub fn extract_tunnel_url(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|token| token.starts_with("https://") || token.starts_with("http://"))
        .map(|token| token.trim_end_matches(')').to_string())
}
