//! Shared test helpers for hdckit-core integration tests.
//!
//! Provides a scriptable mock HDC daemon and a mock uitest kit, both on
//! ephemeral localhost ports.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use hdckit_core::device::PortAllocator;
use hdckit_core::kit::read_kit_frame;
use hdckit_core::pool::ConnectionConfig;
use hdckit_core::protocol::{
    decode_command, decode_connect_identity, encode_daemon_greeting, encode_frame,
    encode_kit_frame, read_frame_length,
};
use hdckit_core::rpc::RpcRequest;

// ---------------------------------------------------------------------------
// Mock HDC daemon
// ---------------------------------------------------------------------------

/// One command as seen by the mock daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub identity: String,
    pub command: String,
}

pub struct MockDaemon {
    pub addr: SocketAddr,
    pub commands: Arc<Mutex<Vec<Received>>>,
    /// Bytes streamed after `file send` commands.
    pub uploads: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockDaemon {
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            capacity: 2,
            ..Default::default()
        }
    }

    pub fn commands(&self) -> Vec<Received> {
        self.commands.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.commands().into_iter().map(|r| r.command).collect()
    }
}

async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Option<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.ok()?;
    let mut payload = vec![0u8; read_frame_length(&header) as usize];
    stream.read_exact(&mut payload).await.ok()?;
    Some(payload)
}

/// Start a daemon that answers every command with `respond(identity, command)`.
///
/// Each connection gets the greeting, then one connect packet and one command
/// are read. For `file send` the data chunks up to the end-of-stream chunk are
/// collected before answering. The reply is sent as one chunk followed by a
/// clean close.
pub async fn mock_daemon<F>(respond: F) -> MockDaemon
where
    F: Fn(&str, &str) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let commands = Arc::new(Mutex::new(Vec::new()));
    let uploads = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let seen = commands.clone();
    let uploaded = uploads.clone();
    tokio::spawn(async move {
        let mut channel_id = 0u32;
        while let Ok((mut stream, _)) = listener.accept().await {
            channel_id += 1;
            let seen = seen.clone();
            let uploaded = uploaded.clone();
            let respond = respond.clone();
            tokio::spawn(async move {
                if stream.write_all(&encode_daemon_greeting(channel_id)).await.is_err() {
                    return;
                }
                let Some(connect) = read_frame(&mut stream).await else {
                    return;
                };
                let identity = decode_connect_identity(&connect).unwrap();
                let Some(frame) = read_frame(&mut stream).await else {
                    return;
                };
                let command = decode_command(&frame);

                if command.starts_with("file send") {
                    let mut data = Vec::new();
                    while let Some(chunk) = read_frame(&mut stream).await {
                        if chunk.is_empty() {
                            break;
                        }
                        data.extend_from_slice(&chunk);
                    }
                    uploaded.lock().unwrap().push(data);
                }

                let reply = respond(&identity, &command);
                seen.lock().unwrap().push(Received { identity, command });
                if !reply.is_empty() {
                    let _ = stream.write_all(&encode_frame(&reply)).await;
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    MockDaemon {
        addr,
        commands,
        uploads,
    }
}

/// A daemon whose replies come from a fixed `(command prefix, reply)` table.
/// Unmatched commands get an empty reply.
pub async fn table_daemon(table: &[(&str, &str)]) -> MockDaemon {
    let table: Vec<(String, String)> = table
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    mock_daemon(move |_, command| {
        table
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone().into_bytes())
            .unwrap_or_default()
    })
    .await
}

// ---------------------------------------------------------------------------
// Mock uitest kit
// ---------------------------------------------------------------------------

pub struct MockKit {
    pub port: u16,
    pub requests: Arc<Mutex<Vec<RpcRequest>>>,
}

impl MockKit {
    pub fn apis(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.params.api.clone())
            .collect()
    }
}

/// Start a kit that answers each request with the frames returned by
/// `respond`, all tagged with the request's session id.
pub async fn mock_kit<F>(respond: F) -> MockKit
where
    F: Fn(&RpcRequest) -> Vec<Vec<u8>> + Send + Sync + 'static,
{
    spawn_kit(respond, false).await
}

/// Standard kit whose first connection is dropped when it receives any call
/// other than `Driver.create`. Later connections behave normally.
pub async fn flaky_kit() -> MockKit {
    spawn_kit(|request| vec![json_bytes(&standard_reply(request))], true).await
}

async fn spawn_kit<F>(respond: F, drop_first: bool) -> MockKit
where
    F: Fn(&RpcRequest) -> Vec<Vec<u8>> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let seen = requests.clone();
    tokio::spawn(async move {
        let mut connection = 0;
        while let Ok((mut stream, _)) = listener.accept().await {
            connection += 1;
            let drop_this = drop_first && connection == 1;
            let seen = seen.clone();
            let respond = respond.clone();
            tokio::spawn(async move {
                while let Ok((sid, payload)) = read_kit_frame(&mut stream).await {
                    let request: RpcRequest = serde_json::from_slice(&payload).unwrap();
                    let frames = respond(&request);
                    let create = request.params.api == "Driver.create";
                    seen.lock().unwrap().push(request);
                    if drop_this && !create {
                        return;
                    }
                    for frame in frames {
                        if stream.write_all(&encode_kit_frame(sid, &frame)).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    MockKit { port, requests }
}

/// Kit with the usual answers: handles for `create` calls, a display size,
/// and `true` for everything else.
pub async fn standard_kit() -> MockKit {
    mock_kit(|request| vec![json_bytes(&standard_reply(request))]).await
}

pub fn standard_reply(request: &RpcRequest) -> Value {
    match request.params.api.as_str() {
        "Driver.create" => json!({ "result": "Driver#0" }),
        "PointerMatrix.create" => json!({ "result": "PointerMatrix#0" }),
        "Driver.getDisplaySize" => json!({ "result": { "x": 1080, "y": 2340 } }),
        "Driver.getDisplayRotation" => json!({ "result": 0 }),
        _ => json!({ "result": true }),
    }
}

pub fn json_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

// ---------------------------------------------------------------------------
// Port allocation
// ---------------------------------------------------------------------------

/// Always hands out the same port, so forwards land on a mock kit.
pub struct FixedPort(pub u16);

impl PortAllocator for FixedPort {
    fn allocate_free_port(&self) -> std::io::Result<u16> {
        Ok(self.0)
    }
}
