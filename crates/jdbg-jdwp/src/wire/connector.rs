use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use jdbg_config::JdwpConfig;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    net::lookup_host,
    process::Command,
};

use super::{
    client::{ClientOptions, JdwpClient},
    target::JdwpTarget,
};
use crate::{LaunchConfig, Result, TargetConnection, TargetConnector, TargetError, TargetKind};

const LISTEN_BANNER: &str = "Listening for transport dt_socket at address:";

/// Opens JDWP connections for every [`TargetKind`] that can be reached over
/// a socket.
#[derive(Debug, Clone)]
pub struct JdwpConnector {
    options: ClientOptions,
    java: String,
}

impl JdwpConnector {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            java: "java".to_string(),
        }
    }

    /// Build a connector from the `[jdwp]` table of the jdbg config file.
    pub fn from_config(config: &JdwpConfig) -> Self {
        Self::new(ClientOptions {
            connect_timeout: Duration::from_millis(config.handshake_timeout_ms),
            command_timeout: Duration::from_millis(config.reply_timeout_ms),
            event_backlog: config.event_channel_size,
        })
        .with_java(config.java.clone())
    }

    /// The `java` launcher used for [`TargetKind::Launch`].
    pub fn with_java(mut self, java: impl Into<String>) -> Self {
        self.java = java.into();
        self
    }

    async fn attach(&self, host: &str, port: u16) -> Result<JdwpTarget> {
        let addr = lookup_host((host, port)).await?.next().ok_or_else(|| {
            TargetError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("could not resolve {host}:{port}"),
            ))
        })?;
        tracing::info!(target: "jdbg.jdwp", %addr, "attaching to JDWP agent");
        let client = JdwpClient::connect_with_options(addr, self.options.clone()).await?;
        Ok(JdwpTarget::new(client))
    }

    async fn launch(&self, launch: &LaunchConfig) -> Result<JdwpTarget> {
        let mut cmd = Command::new(&self.java);
        cmd.arg("-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address=127.0.0.1:0");
        cmd.args(&launch.jvm_args);
        if !launch.classpath.is_empty() {
            let classpath = std::env::join_paths(&launch.classpath).map_err(|err| {
                TargetError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
            })?;
            cmd.arg("-cp");
            cmd.arg(classpath);
        }
        cmd.arg(&launch.main_class);
        cmd.args(&launch.program_args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            TargetError::Io(std::io::Error::new(
                err.kind(),
                format!("failed to spawn {}: {err}", self.java),
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TargetError::Protocol("debuggee stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        let mut lines = BufReader::new(stdout).lines();
        let port = tokio::time::timeout(self.options.connect_timeout, async {
            while let Some(line) = lines.next_line().await? {
                if let Some(port) = parse_listen_banner(&line) {
                    return Ok(Some(port));
                }
                tracing::debug!(target: "jdbg.debuggee", stream = "stdout", "{line}");
            }
            Ok::<_, std::io::Error>(None)
        })
        .await
        .map_err(|_| TargetError::Timeout)??;

        let Some(port) = port else {
            let _ = child.start_kill();
            return Err(TargetError::Protocol(
                "debuggee exited before the JDWP agent started listening".to_string(),
            ));
        };

        // The rest of stdout is program output; keep draining it so the
        // debuggee never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "jdbg.debuggee", stream = "stdout", "{line}");
            }
        });

        tracing::info!(
            target: "jdbg.jdwp",
            main_class = %launch.main_class,
            port,
            pid = child.id(),
            "launched debuggee"
        );
        match self.attach("127.0.0.1", port).await {
            Ok(target) => Ok(target.with_child(child)),
            Err(err) => {
                let _ = child.start_kill();
                Err(err)
            }
        }
    }
}

impl Default for JdwpConnector {
    fn default() -> Self {
        Self::new(ClientOptions::default())
    }
}

#[async_trait]
impl TargetConnector for JdwpConnector {
    async fn connect(&self, target: &TargetKind) -> Result<Arc<dyn TargetConnection>> {
        let target = match target {
            TargetKind::Remote { host, port } => self.attach(host, *port).await?,
            TargetKind::Local { pid } => {
                return Err(TargetError::Unsupported(format!(
                    "attaching to local process {pid} requires the JVM attach API; \
                     start the VM with a JDWP agent and attach remotely"
                )))
            }
            TargetKind::Launch(launch) => self.launch(launch).await?,
        };
        Ok(Arc::new(target))
    }
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "jdbg.debuggee", stream, "{line}");
    }
}

/// Port announced by the JDWP agent, e.g.
/// `Listening for transport dt_socket at address: 50123`.
fn parse_listen_banner(line: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix(LISTEN_BANNER)?;
    let address = rest.trim();
    // Newer agents may print `host:port`.
    let port = address.rsplit(':').next().unwrap_or(address);
    port.parse().ok()
}
