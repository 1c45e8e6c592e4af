//! エージェントに接続してプロセスツリーを表示する

use anyhow::{bail, Context, Result};
use kokia_client::{MessageLoop, RemoteApiImpl, Session, SessionConfig};
use kokia_wire::{ProcessTreeKind, ProcessTreeRecord};
use std::cell::RefCell;
use std::rc::Rc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub async fn ps(connect: &str) -> Result<()> {
    let mut socket = TcpStream::connect(connect)
        .await
        .with_context(|| format!("Failed to connect to {}", connect))?;
    let message_loop = MessageLoop::new();
    let api = RemoteApiImpl::new(message_loop.clone());
    let mut session = Session::new(Box::new(api.clone()), message_loop, SessionConfig::default());

    let arch = Rc::new(RefCell::new(None));
    let out = arch.clone();
    session.connect(move |_, result| *out.borrow_mut() = Some(result));
    pump_until(&mut socket, &api, &mut session, || arch.borrow().is_some()).await?;
    let arch = arch.borrow_mut().take().context("Handshake did not complete")??;
    info!("Connected to {:?} agent at {}", arch, connect);

    let tree = Rc::new(RefCell::new(None));
    let out = tree.clone();
    session.process_tree(move |_, result| *out.borrow_mut() = Some(result));
    pump_until(&mut socket, &api, &mut session, || tree.borrow().is_some()).await?;
    let root = tree.borrow_mut().take().context("No process tree reply")??;

    print!("{}", format_tree(&root));
    Ok(())
}

/// 要求を書き出し、`done` が真になるまで応答を読み込む
async fn pump_until(
    socket: &mut TcpStream,
    api: &RemoteApiImpl,
    session: &mut Session,
    done: impl Fn() -> bool,
) -> Result<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        session.run_until_idle();
        let out = api.take_write_data();
        if !out.is_empty() {
            socket.write_all(&out).await.context("Socket write failed")?;
        }
        if done() {
            return Ok(());
        }
        let n = socket.read(&mut buf).await.context("Socket read failed")?;
        if n == 0 {
            bail!("Agent closed the connection");
        }
        api.add_read_data(&buf[..n]);
    }
}

/// ジョブとプロセスを字下げして1行ずつ並べる
fn format_tree(root: &ProcessTreeRecord) -> String {
    let mut out = String::new();
    write_node(root, 0, &mut out);
    out
}

fn write_node(node: &ProcessTreeRecord, depth: usize, out: &mut String) {
    let kind = match node.kind {
        ProcessTreeKind::Job => 'j',
        ProcessTreeKind::Process => 'p',
    };
    out.push_str(&format!("{:indent$}{}: {} {}\n", "", kind, node.koid, node.name, indent = depth * 2));
    for child in &node.children {
        write_node(child, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(kind: ProcessTreeKind, koid: u64, name: &str, children: Vec<ProcessTreeRecord>) -> ProcessTreeRecord {
        ProcessTreeRecord { kind, koid, name: name.into(), children }
    }

    #[test]
    fn test_format_tree() {
        let root = node(
            ProcessTreeKind::Job,
            0,
            "system",
            vec![
                node(ProcessTreeKind::Process, 1, "init", vec![node(ProcessTreeKind::Process, 42, "sh", vec![])]),
                node(ProcessTreeKind::Process, 7, "app", vec![]),
            ],
        );
        assert_eq!(format_tree(&root), "j: 0 system\n  p: 1 init\n    p: 42 sh\n  p: 7 app\n");
    }
}
