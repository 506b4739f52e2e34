//! Ways of obtaining a byte stream to a language server.
//!
//! All transports are structurally equivalent once connected; they differ
//! only in how the stream is obtained and how the server process is
//! launched. In the non-stdio modes the library binds the endpoint and the
//! server connects to it.

use crate::transport::{ServerReader, ServerWriter};
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::BufReader;
use tokio::process::{Child, Command};

/// How the byte stream to the server is established.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Connect {
    /// Child process stdin/stdout; stderr is captured and forwarded to the
    /// log at warning level.
    #[default]
    Stdio,
    /// TCP socket on the loopback interface. The library binds `port` and
    /// the launched server connects to it.
    Tcp { port: u16 },
    /// UNIX domain socket bound by the library.
    #[cfg(unix)]
    UnixSocket { path: PathBuf },
    /// Windows named pipe; `name` must live under `\\.\pipe\`.
    #[cfg(windows)]
    NamedPipe { name: String },
}

/// Parameters for launching a language server.
///
/// Either `command` (an executable resolved against `$PATH`) or
/// `launch_command` (a full shell command line) starts the server process.
/// For the non-stdio connection modes both may be omitted, in which case the
/// server is expected to be launched externally and connect to the bound
/// endpoint.
#[derive(Debug, Clone, Default)]
pub struct LaunchParams {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub launch_command: Option<String>,
    pub cwd: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub connect: Connect,
}

impl LaunchParams {
    pub fn stdio(command: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        LaunchParams {
            command: Some(command.into()),
            args: args.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn shell(launch_command: impl Into<String>) -> Self {
        LaunchParams {
            launch_command: Some(launch_command.into()),
            ..Default::default()
        }
    }

    pub fn with_connect(mut self, connect: Connect) -> Self {
        self.connect = connect;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn command_builder(&self, piped: bool) -> Result<Command> {
        let mut cmd = if let Some(command) = &self.command {
            let binary = scribe_stdx::env::which(command).map_err(|err| {
                Error::Other(anyhow::anyhow!("failed to resolve server binary: {err}"))
            })?;
            let mut cmd = Command::new(binary);
            cmd.args(&self.args);
            cmd
        } else if let Some(launch_command) = &self.launch_command {
            #[cfg(windows)]
            let cmd = {
                let mut cmd = Command::new("cmd");
                cmd.args(["/C", launch_command]);
                cmd
            };
            #[cfg(not(windows))]
            let cmd = {
                let mut cmd = Command::new("sh");
                cmd.args(["-c", launch_command]);
                cmd
            };
            cmd
        } else {
            return Err(Error::Other(anyhow::anyhow!(
                "either command or launch_command must be set"
            )));
        };

        cmd.envs(&self.environment);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        if piped {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        // make sure the server is reaped when the client goes away
        cmd.kill_on_drop(true);
        Ok(cmd)
    }

    fn spawn_detached(&self) -> Result<Option<Child>> {
        if self.command.is_none() && self.launch_command.is_none() {
            // externally launched server will connect to the bound endpoint
            return Ok(None);
        }
        let child = self.command_builder(false)?.spawn()?;
        Ok(Some(child))
    }

    /// Establish the connection, launching the server process as required.
    pub(crate) async fn establish(&self, name: &str) -> Result<ServerStreams> {
        match &self.connect {
            Connect::Stdio => {
                log::info!("[{name}] launching language server over stdio");
                let mut process = self.command_builder(true)?.spawn()?;
                let writer = process
                    .stdin
                    .take()
                    .ok_or_else(|| Error::Other(anyhow::anyhow!("failed to open server stdin")))?;
                let reader = process
                    .stdout
                    .take()
                    .ok_or_else(|| Error::Other(anyhow::anyhow!("failed to open server stdout")))?;
                let stderr = process.stderr.take().map(|stderr| {
                    Box::new(BufReader::new(stderr)) as ServerReader
                });
                Ok(ServerStreams {
                    reader: Box::new(BufReader::new(reader)),
                    writer: Box::new(writer),
                    stderr,
                    process: Some(process),
                })
            }
            Connect::Tcp { port } => {
                log::info!("[{name}] waiting for server connection on 127.0.0.1:{port}");
                let listener = tokio::net::TcpListener::bind(("127.0.0.1", *port)).await?;
                let process = self.spawn_detached()?;
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok(ServerStreams {
                    reader: Box::new(BufReader::new(reader)),
                    writer: Box::new(writer),
                    stderr: None,
                    process,
                })
            }
            #[cfg(unix)]
            Connect::UnixSocket { path } => {
                log::info!(
                    "[{name}] waiting for server connection on socket {}",
                    path.display()
                );
                let listener = tokio::net::UnixListener::bind(path)?;
                let process = self.spawn_detached()?;
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok(ServerStreams {
                    reader: Box::new(BufReader::new(reader)),
                    writer: Box::new(writer),
                    stderr: None,
                    process,
                })
            }
            #[cfg(windows)]
            Connect::NamedPipe { name: pipe_name } => {
                log::info!("[{name}] waiting for server connection on pipe {pipe_name}");
                let pipe = tokio::net::windows::named_pipe::ServerOptions::new()
                    .first_pipe_instance(true)
                    .create(pipe_name)?;
                let process = self.spawn_detached()?;
                pipe.connect().await?;
                let (reader, writer) = tokio::io::split(pipe);
                Ok(ServerStreams {
                    reader: Box::new(BufReader::new(reader)),
                    writer: Box::new(writer),
                    stderr: None,
                    process,
                })
            }
        }
    }
}

pub(crate) struct ServerStreams {
    pub reader: ServerReader,
    pub writer: ServerWriter,
    pub stderr: Option<ServerReader>,
    pub process: Option<Child>,
}
