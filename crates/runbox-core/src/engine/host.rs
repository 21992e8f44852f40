//! Host engine: runs `<shell> -c <command>` as a local child process.
//!
//! `start`/`wait` use `tokio::process`; [`Engine::terminal`] runs the same
//! command under a pseudo-terminal from `portable-pty`.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::process::ProcessRunner;
use super::{Engine, EngineState, Lifecycle, guard_start};
use crate::config::Config;
use crate::error::{CommandError, Result, exit_result};
use crate::io::{CHUNK_CHANNEL_CAPACITY, ChunkReader, StdioSlots, lock};
use crate::terminal::Terminal;

pub const NAME: &str = "host";

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// User identity
// ---------------------------------------------------------------------------

/// An OS account the command runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

impl UserIdentity {
    /// Resolve `name` through the system password database.
    #[cfg(unix)]
    pub fn lookup(name: &str) -> Result<Self> {
        use std::ffi::{CStr, CString};

        let c_name = CString::new(name)
            .map_err(|_| CommandError::InvalidConfig(format!("invalid user name: {name:?}")))?;
        // SAFETY: passwd is plain old data; getpwnam_r fills it in.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; 16 * 1024];
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        // SAFETY: every pointer refers to a live local buffer of the stated size.
        let rc = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if rc != 0 || result.is_null() {
            return Err(CommandError::InvalidConfig(format!("unknown user: {name}")));
        }

        // SAFETY: on success pw_dir points into `buf`, which is still alive.
        let home = unsafe { CStr::from_ptr(pwd.pw_dir) }
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            name: name.to_string(),
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
            home,
        })
    }

    #[cfg(not(unix))]
    pub fn lookup(_name: &str) -> Result<Self> {
        Err(CommandError::Unsupported(
            "running as another user is only supported on unix".into(),
        ))
    }
}

/// The environment a host command sees, lowest precedence first: parent
/// variables (all of them, or just the allow-list), `TERM`, the impersonated
/// user's identity, history suppression, then the caller's variables.
pub fn compose_environment(
    config: &Config,
    identity: Option<&UserIdentity>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = if config.inherit_environment {
        std::env::vars().collect()
    } else {
        config.allowed_system_environment()
    };
    env.insert("TERM".into(), "xterm".into());

    if let Some(identity) = identity {
        env.insert("USER".into(), identity.name.clone());
        env.insert("LOGNAME".into(), identity.name.clone());
        env.insert("HOME".into(), identity.home.clone());
        env.insert("UID".into(), identity.uid.to_string());
        env.insert("GID".into(), identity.gid.to_string());
    }
    if config.history_disabled {
        env.insert("HISTFILE".into(), "/dev/null".into());
    }

    env.extend(config.environment.clone());
    env
}

// ---------------------------------------------------------------------------
// HostEngine
// ---------------------------------------------------------------------------

pub struct HostEngine {
    config: Config,
    identity: Option<UserIdentity>,
    stdio: StdioSlots,
    lifecycle: Lifecycle,
    runner: ProcessRunner,
}

impl HostEngine {
    pub fn new(config: Config) -> Result<Self> {
        let identity = match config.user.as_deref() {
            Some(user) if !user.is_empty() => Some(UserIdentity::lookup(user)?),
            _ => None,
        };
        Ok(Self {
            config,
            identity,
            stdio: StdioSlots::default(),
            lifecycle: Lifecycle::new(),
            runner: ProcessRunner::new(),
        })
    }

    fn workdir(&self) -> Option<&str> {
        self.config.workdir.as_deref().filter(|dir| !dir.is_empty())
    }

    fn environment(&self) -> BTreeMap<String, String> {
        compose_environment(&self.config, self.identity.as_ref())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.shell);
        if !self.config.command.is_empty() {
            command.arg("-c").arg(&self.config.command);
        }
        command.env_clear().envs(self.environment());
        if let Some(dir) = self.workdir() {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        if let Some(identity) = &self.identity {
            command.uid(identity.uid).gid(identity.gid);
        }
        command
    }

    fn pty_command(&self) -> CommandBuilder {
        let mut command = CommandBuilder::new(&self.config.shell);
        if !self.config.command.is_empty() {
            command.arg("-c");
            command.arg(&self.config.command);
        }
        command.env_clear();
        for (key, value) in self.environment() {
            command.env(key, value);
        }
        if let Some(dir) = self.workdir() {
            command.cwd(dir);
        }
        command
    }
}

#[async_trait]
impl Engine for HostEngine {
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
        guard_start(&self.lifecycle, self.runner.spawn(self.command(), &self.stdio)).await?;
        self.lifecycle.advance(EngineState::Running)?;
        info!(engine = NAME, id = %self.config.id, "command started");
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let result = match self.runner.wait().await {
            Ok(code) => exit_result(code),
            Err(e) => Err(e),
        };
        self.lifecycle.finish(&result);
        debug!(engine = NAME, id = %self.config.id, state = %self.lifecycle.get(), "command finished");
        result
    }

    async fn cancel(&self) -> Result<()> {
        if self.lifecycle.cancel() {
            info!(engine = NAME, id = %self.config.id, "canceling command");
        }
        self.runner.cancel().await;
        Ok(())
    }

    async fn terminal(&self) -> Result<Box<dyn Terminal>> {
        if self.identity.is_some() {
            return Err(CommandError::Unsupported(
                "host terminal cannot run as another user".into(),
            ));
        }
        self.lifecycle.transition(EngineState::Running)?;
        let terminal = PtyTerminal::spawn(self.pty_command(), self.config.read_only)
            .inspect_err(|_| self.lifecycle.fail())?;
        info!(engine = NAME, id = %self.config.id, "terminal opened");
        Ok(Box::new(terminal))
    }
}

// ---------------------------------------------------------------------------
// PtyTerminal
// ---------------------------------------------------------------------------

struct PtyTerminal {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    output: ChunkReader,
    exit_code: OnceLock<i32>,
    read_only: bool,
}

impl PtyTerminal {
    fn spawn(command: CommandBuilder, read_only: bool) -> Result<Self> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CommandError::backend(NAME, format!("failed to open pty: {e}")))?;

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| CommandError::backend(NAME, format!("failed to spawn in pty: {e}")))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| CommandError::backend(NAME, e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| CommandError::backend(NAME, e))?;

        // The pty reader blocks, so it gets its own thread.
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            output: ChunkReader::new(rx),
            exit_code: OnceLock::new(),
            read_only,
        })
    }
}

#[async_trait]
impl Terminal for PtyTerminal {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.output.read(buf).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Ok(0);
        }
        let mut writer = lock(&self.writer);
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| CommandError::backend(NAME, format!("failed to resize pty: {e}")))
    }

    async fn wait(&self) -> Result<()> {
        loop {
            let status = lock(&self.child).try_wait()?;
            if let Some(status) = status {
                let code = status.exit_code() as i32;
                let _ = self.exit_code.set(code);
                return exit_result(code);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    async fn close(&self) -> Result<()> {
        let mut child = lock(&self.child);
        if matches!(child.try_wait(), Ok(None)) {
            let _ = child.kill();
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::SharedBuffer;

    fn host(command: &str) -> HostEngine {
        let mut config = Config::new(command);
        config.apply_defaults();
        HostEngine::new(config).unwrap()
    }

    #[test]
    fn environment_always_sets_term() {
        let config = Config::new("true");
        let env = compose_environment(&config, None);
        assert_eq!(env["TERM"], "xterm");
    }

    #[test]
    fn caller_environment_wins() {
        let config = Config {
            history_disabled: true,
            ..Config::new("true")
                .with_env("TERM", "dumb")
                .with_env("HISTFILE", "/tmp/h")
        };
        let env = compose_environment(&config, None);
        assert_eq!(env["TERM"], "dumb");
        assert_eq!(env["HISTFILE"], "/tmp/h");
    }

    #[test]
    fn history_suppression() {
        let config = Config {
            history_disabled: true,
            ..Config::new("true")
        };
        assert_eq!(compose_environment(&config, None)["HISTFILE"], "/dev/null");
    }

    #[test]
    fn allow_list_only_copies_named_keys() {
        let config = Config {
            allowed_system_env_keys: vec!["PATH".into(), "RUNBOX_SURELY_UNSET_VAR".into()],
            ..Config::new("true")
        };
        let env = compose_environment(&config, None);
        assert_eq!(env.get("PATH"), std::env::var("PATH").ok().as_ref());
        assert!(!env.contains_key("RUNBOX_SURELY_UNSET_VAR"));
    }

    #[test]
    fn identity_variables_are_injected() {
        let identity = UserIdentity {
            name: "builder".into(),
            uid: 1001,
            gid: 1002,
            home: "/home/builder".into(),
        };
        let env = compose_environment(&Config::new("true"), Some(&identity));
        assert_eq!(env["USER"], "builder");
        assert_eq!(env["LOGNAME"], "builder");
        assert_eq!(env["HOME"], "/home/builder");
        assert_eq!(env["UID"], "1001");
        assert_eq!(env["GID"], "1002");
    }

    #[test]
    fn unknown_user_is_a_config_error() {
        let config = Config {
            user: Some("runbox-no-such-user".into()),
            ..Config::new("true")
        };
        assert!(matches!(
            HostEngine::new(config),
            Err(CommandError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn runs_in_workdir() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::new("pwd");
        config.workdir = Some(dir.path().to_string_lossy().into_owned());
        config.apply_defaults();
        let engine = HostEngine::new(config).unwrap();

        let out = SharedBuffer::new();
        engine.set_stdout(Box::new(out.clone()));
        engine.start().await.unwrap();
        engine.wait().await.unwrap();

        let printed = std::fs::canonicalize(out.to_string_lossy().trim()).unwrap();
        assert_eq!(printed, std::fs::canonicalize(dir.path()).unwrap());
        assert_eq!(engine.state(), EngineState::Completed);
    }

    #[tokio::test]
    async fn stderr_is_separate_target() {
        let engine = host("echo oops >&2");
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        engine.set_stdout(Box::new(out.clone()));
        engine.set_stderr(Box::new(err.clone()));
        engine.start().await.unwrap();
        engine.wait().await.unwrap();
        assert_eq!(out.to_string_lossy(), "");
        assert_eq!(err.to_string_lossy(), "oops\n");
    }

    #[tokio::test]
    async fn cancel_kills_running_command() {
        let engine = host("sleep 30");
        engine.set_stdout(Box::new(SharedBuffer::new()));
        engine.start().await.unwrap();
        engine.cancel().await.unwrap();
        assert!(matches!(engine.wait().await, Err(CommandError::Canceled)));
        assert_eq!(engine.state(), EngineState::Canceled);
        engine.cancel().await.unwrap();
    }

    #[tokio::test]
    async fn terminal_reports_output_and_exit_code() {
        let engine = host("echo from-pty; exit 5");
        let terminal = engine.terminal().await.unwrap();

        let err = terminal.wait().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(5));
        assert_eq!(terminal.exit_code(), Some(5));

        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while !String::from_utf8_lossy(&out).contains("from-pty") {
            let n = terminal.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert!(String::from_utf8_lossy(&out).contains("from-pty"));
        terminal.close().await.unwrap();
    }

    #[tokio::test]
    async fn read_only_terminal_discards_writes() {
        let mut config = Config::new("sleep 1");
        config.read_only = true;
        config.apply_defaults();
        let engine = HostEngine::new(config).unwrap();
        let terminal = engine.terminal().await.unwrap();
        assert_eq!(terminal.write(b"ignored\n").await.unwrap(), 0);
        terminal.close().await.unwrap();
    }
}
