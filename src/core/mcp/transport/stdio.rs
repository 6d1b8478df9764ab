use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};

use super::Transport;
use crate::core::mcp::rpc::RpcSession;

const STDERR_CAPTURE_CHARS: usize = 2000;

/// A child process speaking newline-delimited JSON-RPC on stdin/stdout.
pub(crate) struct StdioTransport {
    _child: Mutex<Option<Child>>,
    tx_req: mpsc::Sender<String>,
    stderr: Arc<Mutex<String>>,
}

impl StdioTransport {
    pub(crate) fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        session: Arc<RpcSession>,
    ) -> Result<Self> {
        let server_id = session.server_id().to_string();
        info!("Starting MCP Server: {} ({})", server_id, command);

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn MCP server [{}]: {}", server_id, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to open MCP stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to open MCP stdout"))?;
        let stderr_pipe = child.stderr.take();

        let (tx_req, mut rx_req) = mpsc::channel::<String>(100);
        let mut stdin_writer = tokio::io::BufWriter::new(stdin);
        let writer_id = server_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx_req.recv().await {
                debug!("MCP TX [{}]: {}", writer_id, msg);
                if let Err(e) = stdin_writer
                    .write_all(format!("{}\n", msg).as_bytes())
                    .await
                {
                    error!("Failed to write to MCP stdin [{}]: {}", writer_id, e);
                    break;
                }
                let _ = stdin_writer.flush().await;
            }
        });

        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                session.dispatch_raw(&line).await;
            }
            session.close().await;
        });

        let stderr = Arc::new(Mutex::new(String::new()));
        if let Some(stderr_pipe) = stderr_pipe {
            let stderr_log = stderr.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr_pipe).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let mut s = stderr_log.lock().await;
                    if s.len() < STDERR_CAPTURE_CHARS {
                        s.push_str(&line);
                        s.push('\n');
                    }
                    debug!("MCP STDERR [{}]: {}", server_id, line);
                }
            });
        }

        Ok(Self {
            _child: Mutex::new(Some(child)),
            tx_req,
            stderr,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: String) -> Result<()> {
        self.tx_req
            .send(message)
            .await
            .map_err(|_| anyhow!("MCP stdin writer has stopped"))
    }

    async fn diagnostics(&self) -> String {
        let stderr = self.stderr.lock().await;
        if stderr.is_empty() {
            String::new()
        } else {
            format!("Stderr: {}", stderr.trim_end())
        }
    }
}
