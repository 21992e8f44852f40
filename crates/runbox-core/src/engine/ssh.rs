//! SSH engine: runs the command on a remote host over one session channel.
//!
//! The connection is dialed and authenticated when the engine is built, so
//! bad credentials fail at construction. Each run opens one channel, driven
//! by a background task that owns it.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Engine, EngineState, Lifecycle, guard_start};
use crate::config::Config;
use crate::error::{CommandError, Result, exit_result};
use crate::io::{BoxReader, BoxWriter, CHUNK_CHANNEL_CAPACITY, ChunkReader, StdioSlots};
use crate::terminal::Terminal;

pub const NAME: &str = "ssh";

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_USER: &str = "root";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TERMINAL_ROWS: u32 = 100;
const TERMINAL_COLS: u32 = 300;
const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 0),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Where to connect, with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl Endpoint {
    pub fn from_config(config: &Config) -> Result<Self> {
        let host = config
            .ssh_host
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CommandError::InvalidConfig("ssh_host is required".into()))?;
        Ok(Self {
            host,
            port: config.ssh_port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT),
            user: config
                .ssh_user
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_USER.to_string()),
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Credentials to present. A private key wins over a password.
pub(crate) enum AuthMethod {
    PrivateKey {
        pem: String,
        passphrase: Option<String>,
    },
    Password(String),
    None,
}

pub(crate) fn auth_method(config: &Config) -> AuthMethod {
    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.is_empty());
    if let Some(pem) = non_empty(&config.ssh_private_key) {
        return AuthMethod::PrivateKey {
            pem,
            passphrase: non_empty(&config.ssh_private_key_secret),
        };
    }
    match non_empty(&config.ssh_pass) {
        Some(password) => AuthMethod::Password(password),
        None => AuthMethod::None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HostKeyPolicy {
    AcceptAny,
    KnownHosts(PathBuf),
}

pub(crate) fn host_key_policy(config: &Config) -> HostKeyPolicy {
    if config.ssh_ignore_strict_host_key_checking {
        return HostKeyPolicy::AcceptAny;
    }
    match config
        .ssh_known_hosts_file_path
        .as_deref()
        .filter(|p| !p.is_empty())
    {
        Some(path) => HostKeyPolicy::KnownHosts(PathBuf::from(path)),
        None => HostKeyPolicy::AcceptAny,
    }
}

fn session_exit(status: Option<u32>) -> Result<()> {
    match status {
        Some(code) => exit_result(code as i32),
        None => Err(CommandError::backend(
            NAME,
            "session closed without an exit status",
        )),
    }
}

struct HostKeyCheck {
    policy: HostKeyPolicy,
    host: String,
    port: u16,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        let HostKeyPolicy::KnownHosts(path) = &self.policy else {
            return Ok(true);
        };
        match russh_keys::check_known_hosts_path(&self.host, self.port, key, path) {
            Ok(known) => {
                if !known {
                    warn!(host = %self.host, path = %path.display(), "host key not in known_hosts");
                }
                Ok(known)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "host key verification failed");
                Ok(false)
            }
        }
    }
}

async fn dial(config: &Config, endpoint: &Endpoint) -> Result<Handle<HostKeyCheck>> {
    let handler = HostKeyCheck {
        policy: host_key_policy(config),
        host: endpoint.host.clone(),
        port: endpoint.port,
    };
    let connect = client::connect(
        Arc::new(client::Config::default()),
        (endpoint.host.as_str(), endpoint.port),
        handler,
    );
    let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| CommandError::backend(NAME, format!("connect to {endpoint} timed out")))??;

    let authenticated = match auth_method(config) {
        AuthMethod::PrivateKey { pem, passphrase } => {
            let key = russh_keys::decode_secret_key(&pem, passphrase.as_deref()).map_err(|e| {
                CommandError::InvalidConfig(format!("failed to parse private key: {e}"))
            })?;
            handle
                .authenticate_publickey(&endpoint.user, Arc::new(key))
                .await?
        }
        AuthMethod::Password(password) => {
            handle
                .authenticate_password(&endpoint.user, &password)
                .await?
        }
        AuthMethod::None => handle.authenticate_none(&endpoint.user).await?,
    };
    if !authenticated {
        return Err(CommandError::backend(
            NAME,
            format!("authentication failed for {endpoint}"),
        ));
    }
    Ok(handle)
}

// ---------------------------------------------------------------------------
// Channel driver
// ---------------------------------------------------------------------------

/// Requests to the task that owns a session channel.
#[derive(Debug)]
enum Input {
    Data(Vec<u8>),
    Eof,
    Resize { rows: u16, cols: u16 },
    Close,
}

enum OutputSink {
    Writer(BoxWriter),
    Chunks(mpsc::Sender<Vec<u8>>),
}

impl OutputSink {
    async fn write(&mut self, data: &[u8]) {
        match self {
            Self::Writer(writer) => {
                let _ = writer.write_all(data).await;
            }
            Self::Chunks(tx) => {
                let _ = tx.send(data.to_vec()).await;
            }
        }
    }

    async fn flush(&mut self) {
        if let Self::Writer(writer) = self {
            let _ = writer.flush().await;
        }
    }
}

enum Step {
    Remote(Option<ChannelMsg>),
    Local(Option<Input>),
}

/// Own `channel` until the remote side closes it. Returns the exit status,
/// if the server sent one.
async fn drive(
    mut channel: Channel<Msg>,
    mut input: mpsc::Receiver<Input>,
    mut stdout: OutputSink,
    mut stderr: OutputSink,
) -> Result<Option<u32>> {
    let mut status = None;
    let mut input_open = true;
    loop {
        let step = tokio::select! {
            msg = channel.wait() => Step::Remote(msg),
            request = input.recv(), if input_open => Step::Local(request),
        };
        match step {
            Step::Remote(None) | Step::Remote(Some(ChannelMsg::Close)) => break,
            Step::Remote(Some(ChannelMsg::Data { data })) => stdout.write(&data).await,
            Step::Remote(Some(ChannelMsg::ExtendedData { data, ext: 1 })) => {
                stderr.write(&data).await
            }
            Step::Remote(Some(ChannelMsg::ExitStatus { exit_status })) => {
                status = Some(exit_status)
            }
            Step::Remote(Some(_)) => {}
            Step::Local(None) => input_open = false,
            Step::Local(Some(request)) => {
                let sent = match request {
                    Input::Data(bytes) => channel.data(&bytes[..]).await,
                    Input::Eof => channel.eof().await,
                    Input::Resize { rows, cols } => {
                        channel
                            .window_change(u32::from(cols), u32::from(rows), 0, 0)
                            .await
                    }
                    Input::Close => channel.close().await,
                };
                if let Err(e) = sent {
                    debug!(engine = NAME, error = %e, "channel request failed");
                }
            }
        }
    }
    stdout.flush().await;
    stderr.flush().await;
    Ok(status)
}

fn spawn_input_pump(mut reader: BoxReader, tx: mpsc::Sender<Input>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(Input::Data(buf[..n].to_vec())).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(Input::Eof).await;
    });
}

// ---------------------------------------------------------------------------
// SshEngine
// ---------------------------------------------------------------------------

pub struct SshEngine {
    config: Config,
    endpoint: Endpoint,
    handle: tokio::sync::Mutex<Handle<HostKeyCheck>>,
    stdio: StdioSlots,
    lifecycle: Lifecycle,
    driver: tokio::sync::Mutex<Option<JoinHandle<Result<Option<u32>>>>>,
    canceled: CancellationToken,
}

impl SshEngine {
    /// Dial and authenticate.
    pub async fn connect(config: Config) -> Result<Self> {
        let endpoint = Endpoint::from_config(&config)?;
        let handle = dial(&config, &endpoint).await?;
        info!(engine = NAME, target = %endpoint, "ssh connected");
        Ok(Self {
            config,
            endpoint,
            handle: tokio::sync::Mutex::new(handle),
            stdio: StdioSlots::default(),
            lifecycle: Lifecycle::new(),
            driver: tokio::sync::Mutex::new(None),
            canceled: CancellationToken::new(),
        })
    }

    /// Open a session channel with the run's environment applied.
    async fn open_channel(&self) -> Result<Channel<Msg>> {
        let channel = self.handle.lock().await.channel_open_session().await?;
        let mut env = self.config.allowed_system_environment();
        env.extend(self.config.environment.clone());
        for (key, value) in env {
            channel.set_env(false, key, value).await?;
        }
        Ok(channel)
    }

    async fn launch(&self) -> Result<()> {
        let stdout = self.stdio.stdout_or_default();
        let stderr = self.stdio.stderr_or_default();
        let stdin = self.stdio.take_stdin();

        let channel = self.open_channel().await?;
        channel.exec(true, self.config.command.as_str()).await?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        match stdin {
            Some(reader) => spawn_input_pump(reader, tx),
            None => {
                let _ = tx.send(Input::Eof).await;
            }
        }
        let driver = tokio::spawn(drive(
            channel,
            rx,
            OutputSink::Writer(stdout),
            OutputSink::Writer(stderr),
        ));
        *self.driver.lock().await = Some(driver);
        info!(engine = NAME, target = %self.endpoint, "command started");
        Ok(())
    }
}

#[async_trait]
impl Engine for SshEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn state(&self) -> EngineState {
        self.lifecycle.get()
    }

    fn stdio(&self) -> &StdioSlots {
        &self.stdio
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.transition(EngineState::Starting)?;
        guard_start(&self.lifecycle, self.launch()).await?;
        self.lifecycle.advance(EngineState::Running)
    }

    async fn wait(&self) -> Result<()> {
        let driver = self
            .driver
            .lock()
            .await
            .take()
            .ok_or_else(|| CommandError::State("ssh session has not been started".into()))?;

        let result = tokio::select! {
            biased;
            _ = self.canceled.cancelled() => Err(CommandError::Canceled),
            joined = driver => match joined {
                Ok(status) => status.and_then(session_exit),
                Err(e) => Err(CommandError::backend(NAME, format!("session task failed: {e}"))),
            },
        };
        self.lifecycle.finish(&result);
        result
    }

    async fn cancel(&self) -> Result<()> {
        if self.lifecycle.cancel() {
            info!(engine = NAME, target = %self.endpoint, "closing ssh connection");
        }
        self.canceled.cancel();
        let handle = self.handle.lock().await;
        if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
            debug!(engine = NAME, error = %e, "disconnect on an already closed connection");
        }
        Ok(())
    }

    async fn terminal(&self) -> Result<Box<dyn Terminal>> {
        self.lifecycle.transition(EngineState::Running)?;
        let opened = async {
            let channel = self.open_channel().await?;
            channel
                .request_pty(true, "xterm", TERMINAL_COLS, TERMINAL_ROWS, 0, 0, TERMINAL_MODES)
                .await?;
            channel.request_shell(true).await?;

            let (input_tx, input_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
            let (output_tx, output_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
            let driver = tokio::spawn(drive(
                channel,
                input_rx,
                OutputSink::Chunks(output_tx.clone()),
                OutputSink::Chunks(output_tx),
            ));
            Ok::<_, CommandError>(SshTerminal {
                input: input_tx,
                output: ChunkReader::new(output_rx),
                driver: tokio::sync::Mutex::new(Some(driver)),
                exit_code: OnceLock::new(),
                read_only: self.config.read_only,
            })
        };
        let terminal = guard_start(&self.lifecycle, opened).await?;
        Ok(Box::new(terminal))
    }
}

// ---------------------------------------------------------------------------
// SshTerminal
// ---------------------------------------------------------------------------

struct SshTerminal {
    input: mpsc::Sender<Input>,
    output: ChunkReader,
    driver: tokio::sync::Mutex<Option<JoinHandle<Result<Option<u32>>>>>,
    exit_code: OnceLock<i32>,
    read_only: bool,
}

impl SshTerminal {
    async fn request(&self, input: Input) -> io::Result<()> {
        self.input
            .send(input)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ssh session closed"))
    }
}

#[async_trait]
impl Terminal for SshTerminal {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.output.read(buf).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Ok(0);
        }
        self.request(Input::Data(data.to_vec())).await?;
        Ok(data.len())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.request(Input::Resize { rows, cols }).await?;
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let driver = self
            .driver
            .lock()
            .await
            .take()
            .ok_or_else(|| CommandError::State("terminal already waited".into()))?;
        let status = driver
            .await
            .map_err(|e| CommandError::backend(NAME, format!("session task failed: {e}")))??;
        if let Some(code) = status {
            let _ = self.exit_code.set(code as i32);
        }
        session_exit(status)
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    async fn close(&self) -> Result<()> {
        let _ = self.request(Input::Close).await;
        Ok(())
    }
}
