//! エージェントのTCPサーバ
//!
//! クライアントは1度に1つだけ受け付けます。ソケットの受信とSIGCHLDを待ち、
//! 受信したバイト列はディスパッチャへ、OSイベントはエージェントへ渡します。

use anyhow::{anyhow, Context, Result};
use kokia_agent::{AgentConfig, DebugAgent, Dispatcher, RequestHandler};
use kokia_target::linux::LinuxPlatform;
use kokia_wire::{DetachRequest, Stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub async fn serve(listen: &str, config: AgentConfig) -> Result<()> {
    let arch = kokia_target::arch::current()
        .ok_or_else(|| anyhow!("Unsupported host architecture"))?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    // 接続前に起きた子プロセスの変化も取りこぼさない
    let mut sigchld = signal(SignalKind::child()).context("Failed to watch SIGCHLD")?;
    info!("Agent listening on {} ({:?})", listener.local_addr()?, arch.arch());

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };
        info!("Client connected: {}", peer);

        let mut agent = DebugAgent::new(Box::new(LinuxPlatform::new()), arch, config.clone());
        if let Err(e) = run_connection(socket, &mut agent, &mut sigchld).await {
            warn!("Connection ended with error: {:#}", e);
        }
        detach_all(&mut agent);
        info!("Client disconnected: {}", peer);
    }
}

async fn run_connection(
    mut socket: TcpStream,
    agent: &mut DebugAgent,
    sigchld: &mut Signal,
) -> Result<()> {
    let mut dispatcher = Dispatcher::new();
    let mut stream = Stream::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            n = socket.read(&mut buf) => {
                let n = n.context("Socket read failed")?;
                if n == 0 {
                    return Ok(());
                }
                stream.add_read_data(&buf[..n]);
                dispatcher.process(&mut stream, agent);
            }
            _ = sigchld.recv() => debug!("SIGCHLD"),
        }

        // 要求の処理でもイベントが起きうるので毎回取り出す
        agent.handle_os_events(&mut stream);
        if stream.has_write_data() {
            socket
                .write_all(&stream.take_write_data())
                .await
                .context("Socket write failed")?;
        }

        if dispatcher.is_halted() {
            error!("Dispatcher halted, closing connection");
            return Ok(());
        }
    }
}

/// クライアントが残していったプロセスから離れる
fn detach_all(agent: &mut DebugAgent) {
    for process_koid in agent.process_koids() {
        let reply = agent.on_detach(DetachRequest { process_koid });
        if reply.status.is_ok() {
            info!("Detached from {}", process_koid);
        } else {
            warn!("Failed to detach from {}: {}", process_koid, reply.status);
        }
    }
}
