use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use appdock_bridge::{
    config::AuthSettings,
    protocol::{OutboundMessage, TerminalSize},
    provider::{
        ExecHandle, LogSource, LogStream, ProviderError, ShellAttachment, ShellProvider,
    },
    serve,
    state::AppState,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, SinkExt, StreamExt};
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::{TcpListener, TcpStream},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TwoLines;

#[async_trait]
impl LogSource for TwoLines {
    async fn open(&self, container_id: &str) -> Result<LogStream, ProviderError> {
        if container_id != "web" {
            return Err(ProviderError::NotFound(container_id.to_string()));
        }
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"booting\nlisten")),
            Ok(Bytes::from_static(b"ing on :80\n")),
        ];
        Ok(stream::iter(chunks).boxed())
    }
}

struct PipedShell {
    attachment: Mutex<Option<ShellAttachment>>,
}

impl PipedShell {
    /// Returns the provider with the test's ends of the shell's stdin and stdout.
    fn new() -> (Arc<Self>, DuplexStream, DuplexStream) {
        let (shell_stdin, stdin_end) = duplex(4096);
        let (stdout_end, shell_stdout) = duplex(4096);
        let provider = Arc::new(Self {
            attachment: Mutex::new(Some(ShellAttachment {
                input: Box::pin(shell_stdin),
                output: Box::pin(shell_stdout),
            })),
        });
        (provider, stdin_end, stdout_end)
    }
}

#[async_trait]
impl ShellProvider for PipedShell {
    async fn create(&self, container_id: &str) -> Result<ExecHandle, ProviderError> {
        Ok(ExecHandle {
            id: "exec-test".into(),
            container_id: container_id.to_string(),
        })
    }

    async fn attach(&self, _handle: &ExecHandle) -> Result<ShellAttachment, ProviderError> {
        self.attachment
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ProviderError::Unavailable("shell already attached".into()))
    }

    async fn resize(&self, _handle: &ExecHandle, _size: TerminalSize) -> Result<(), ProviderError> {
        Ok(())
    }
}

async fn spawn_server(auth: AuthSettings, shells: Arc<dyn ShellProvider>) -> (SocketAddr, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(Arc::new(auth), Arc::new(TwoLines), shells);
    tokio::spawn(serve(listener, state.clone(), std::future::pending()));
    (addr, state)
}

async fn next_message(client: &mut Client) -> Option<OutboundMessage> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame in time")?;
        match frame.expect("websocket frame") {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

fn rejected_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn log_stream_with_query_token_ends_with_closed() {
    let (shell, _stdin, _stdout) = PipedShell::new();
    let (addr, state) = spawn_server(AuthSettings::default(), shell).await;
    let token = state.tokens.issue("admin", "appdock").unwrap().token;

    let url = format!("ws://{addr}/ws/containers/web/logs?token={token}");
    let (mut client, _) = connect_async(url).await.unwrap();

    assert_eq!(
        next_message(&mut client).await,
        Some(OutboundMessage::Log("booting".into()))
    );
    assert_eq!(
        next_message(&mut client).await,
        Some(OutboundMessage::Log("listening on :80".into()))
    );
    assert_eq!(
        next_message(&mut client).await,
        Some(OutboundMessage::logs_ended())
    );
    assert_eq!(next_message(&mut client).await, None);
}

#[tokio::test]
async fn upgrade_without_token_is_rejected_before_handshake() {
    let (shell, _stdin, _stdout) = PipedShell::new();
    let (addr, _) = spawn_server(AuthSettings::default(), shell).await;

    let err = connect_async(format!("ws://{addr}/ws/containers/web/logs"))
        .await
        .unwrap_err();
    assert_eq!(rejected_status(err), 401);

    let err = connect_async(format!("ws://{addr}/ws/containers/web/exec?token=forged"))
        .await
        .unwrap_err();
    assert_eq!(rejected_status(err), 401);
}

#[tokio::test]
async fn disabled_auth_accepts_upgrade_without_token() {
    let (shell, _stdin, _stdout) = PipedShell::new();
    let (addr, _) = spawn_server(AuthSettings::default().disabled(), shell).await;

    let (mut client, _) = connect_async(format!("ws://{addr}/ws/containers/web/logs"))
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Some(OutboundMessage::Log("booting".into()))
    );
}

#[tokio::test]
async fn unknown_container_gets_one_error_message() {
    let (shell, _stdin, _stdout) = PipedShell::new();
    let (addr, _) = spawn_server(AuthSettings::default().disabled(), shell).await;

    let (mut client, _) = connect_async(format!("ws://{addr}/ws/containers/ghost/logs"))
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Some(OutboundMessage::Error("container ghost not found".into()))
    );
    assert_eq!(next_message(&mut client).await, None);
}

#[tokio::test]
async fn exec_with_bearer_header_bridges_both_directions() {
    let (shell, mut stdin, mut stdout) = PipedShell::new();
    let (addr, state) = spawn_server(AuthSettings::default(), shell).await;
    let token = state.tokens.issue("admin", "appdock").unwrap().token;

    let mut request = format!("ws://{addr}/ws/containers/web/exec")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("authorization", format!("Bearer {token}").parse().unwrap());
    let (mut client, _) = connect_async(request).await.unwrap();

    assert_eq!(
        next_message(&mut client).await,
        Some(OutboundMessage::Output(
            "Connected to container terminal\r\n".into()
        ))
    );

    client
        .send(Message::Text(r#"{"type":"input","data":"ls\n"}"#.into()))
        .await
        .unwrap();
    let mut typed = [0u8; 3];
    tokio::time::timeout(Duration::from_secs(5), stdin.read_exact(&mut typed))
        .await
        .expect("input in time")
        .unwrap();
    assert_eq!(&typed, b"ls\n");

    stdout.write_all(b"bin  etc\r\n").await.unwrap();
    assert_eq!(
        next_message(&mut client).await,
        Some(OutboundMessage::Output("bin  etc\r\n".into()))
    );

    client.close(None).await.unwrap();
}
