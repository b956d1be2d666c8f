//! Minimal IRC server used as the server under test.
//!
//! Understands just enough to exercise the harness: registration, nick
//! collisions, private messages, JOIN, PING/PONG and QUIT. Diagnostics go to
//! stderr; stdout carries one line per connection event.

use anyhow::{Context, Result, bail};
use boxcat_protocol::message::{CMD_PING, CMD_PONG, ERR_NICKNAME_IN_USE, REPLY_WELCOME};
use boxcat_protocol::{Connection, ConnectionOptions, Message};
use clap::Parser;
use std::collections::HashMap;
use std::os::fd::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, Interval, interval_at};
use tracing::{debug, info, warn};

const ERR_NO_SUCH_NICK: &str = "401";
const ERR_UNKNOWN_COMMAND: &str = "421";
const ERR_NOT_REGISTERED: &str = "451";

#[derive(Parser, Debug)]
#[command(about = "Minimal IRC server for boxcat tests", long_about = None)]
struct Args {
    /// Path to the generated `key = value` config
    #[arg(long)]
    conf: PathBuf,

    /// Inherited listening descriptor, used when listen-port is -1
    #[arg(long)]
    listen_fd: Option<RawFd>,

    /// Interval between server PINGs to each client; 0 disables them
    #[arg(long, default_value_t = 0)]
    ping_interval_ms: u64,
}

#[derive(Debug)]
struct StubConf {
    listen_port: i32,
    server_name: String,
}

impl StubConf {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("error reading {}", path.display()))?;

        let mut listen_port = None;
        let mut server_name = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("malformed config line: {line}");
            };
            match key.trim() {
                "listen-port" => listen_port = Some(value.trim().parse()?),
                "server-name" => server_name = Some(value.trim().to_string()),
                other => debug!("ignoring config key {}", other),
            }
        }

        Ok(Self {
            listen_port: listen_port.context("listen-port missing")?,
            server_name: server_name.context("server-name missing")?,
        })
    }
}

type Clients = Arc<Mutex<HashMap<String, mpsc::Sender<Message>>>>;

struct Server {
    name: String,
    clients: Clients,
    ping_interval: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let conf = StubConf::load(&args.conf)?;
    let listener = open_listener(&conf, args.listen_fd).await?;
    info!(
        "{} listening on {}",
        conf.server_name,
        listener.local_addr()?
    );

    let server = Arc::new(Server {
        name: conf.server_name,
        clients: Arc::new(Mutex::new(HashMap::new())),
        ping_interval: (args.ping_interval_ms > 0)
            .then(|| Duration::from_millis(args.ping_interval_ms)),
    });

    loop {
        let (stream, peer) = listener.accept().await?;
        println!("accepted {peer}");
        let server = server.clone();
        tokio::spawn(async move {
            serve_client(server, stream, peer.to_string()).await;
            println!("closed {peer}");
        });
    }
}

async fn open_listener(conf: &StubConf, listen_fd: Option<RawFd>) -> Result<TcpListener> {
    if conf.listen_port >= 0 {
        let port = u16::try_from(conf.listen_port).context("listen-port out of range")?;
        return TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("error binding port {port}"));
    }

    let Some(fd) = listen_fd else {
        bail!("listen-port is {} but no --listen-fd given", conf.listen_port);
    };
    // SAFETY: the harness hands us a bound, listening socket at this
    // descriptor and nothing else in this process owns it.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(std_listener)?)
}

#[derive(Default)]
struct Session {
    nick: Option<String>,
    user: bool,
    welcomed: bool,
}

enum Flow {
    Continue,
    Quit,
}

async fn serve_client(server: Arc<Server>, stream: TcpStream, peer: String) {
    let conn = Connection::from_stream(stream, &ConnectionOptions::default(), &peer);
    let (mut reader, mut writer) = conn.into_split();

    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let writer_label = peer.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = writer.write_message(&message).await {
                warn!("{}: error writing: {}", writer_label, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut pings = server
        .ping_interval
        .map(|period| interval_at(Instant::now() + period, period));
    let mut session = Session::default();

    loop {
        tokio::select! {
            read = reader.read_message() => match read {
                Ok(Some(message)) => {
                    if let Flow::Quit = handle(&server, &mut session, &tx, message).await {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("{}: {}", peer, e);
                    break;
                }
            },
            _ = next_tick(&mut pings) => {
                let ping = server_message(&server.name, CMD_PING, [server.name.as_str()]);
                if tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(nick) = &session.nick {
        server.clients.lock().await.remove(&nick.to_lowercase());
    }
    drop(tx);
    let _ = writer_task.await;
}

async fn next_tick(pings: &mut Option<Interval>) {
    match pings {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn handle(
    server: &Server,
    session: &mut Session,
    tx: &mpsc::Sender<Message>,
    message: Message,
) -> Flow {
    debug!("received {}", message);
    let target = session.nick.clone().unwrap_or_else(|| "*".to_string());

    let replies = match message.command.to_ascii_uppercase().as_str() {
        "NICK" => {
            let Some(nick) = message.params.first() else {
                return Flow::Continue;
            };
            let key = nick.to_lowercase();
            let mut clients = server.clients.lock().await;
            if clients.contains_key(&key) {
                vec![server_message(
                    &server.name,
                    ERR_NICKNAME_IN_USE,
                    [target.as_str(), nick.as_str(), "Nickname is already in use"],
                )]
            } else {
                if let Some(old) = session.nick.replace(nick.clone()) {
                    clients.remove(&old.to_lowercase());
                }
                clients.insert(key, tx.clone());
                drop(clients);
                welcome_if_ready(server, session)
            }
        }
        "USER" => {
            session.user = true;
            welcome_if_ready(server, session)
        }
        "PING" => vec![server_message(
            &server.name,
            CMD_PONG,
            [server.name.clone()].into_iter().chain(message.params.first().cloned()),
        )],
        // Acknowledged so clients can tell their keep-alive reply arrived.
        "PONG" => vec![server_message(
            &server.name,
            "NOTICE",
            [
                target.clone(),
                format!("PONG {}", message.params.join(" ")),
            ],
        )],
        "QUIT" => {
            let _ = tx
                .send(Message::new("ERROR", ["Closing Link: quit"]))
                .await;
            return Flow::Quit;
        }
        "JOIN" if session.welcomed => match message.params.first() {
            Some(channel) => vec![Message {
                prefix: Some(user_prefix(&target)),
                command: "JOIN".to_string(),
                params: vec![channel.clone()],
            }],
            None => Vec::new(),
        },
        "PRIVMSG" if session.welcomed => {
            let (Some(to), Some(text)) = (message.params.first(), message.params.get(1)) else {
                return Flow::Continue;
            };
            let recipient = server.clients.lock().await.get(&to.to_lowercase()).cloned();
            match recipient {
                Some(recipient) => {
                    let relayed = Message {
                        prefix: Some(user_prefix(&target)),
                        command: "PRIVMSG".to_string(),
                        params: vec![to.clone(), text.clone()],
                    };
                    let _ = recipient.send(relayed).await;
                    Vec::new()
                }
                None => vec![server_message(
                    &server.name,
                    ERR_NO_SUCH_NICK,
                    [target.as_str(), to.as_str(), "No such nick/channel"],
                )],
            }
        }
        "JOIN" | "PRIVMSG" => vec![server_message(
            &server.name,
            ERR_NOT_REGISTERED,
            [target.as_str(), "You have not registered"],
        )],
        _ => vec![server_message(
            &server.name,
            ERR_UNKNOWN_COMMAND,
            [target.as_str(), message.command.as_str(), "Unknown command"],
        )],
    };

    for reply in replies {
        if tx.send(reply).await.is_err() {
            return Flow::Quit;
        }
    }
    Flow::Continue
}

fn welcome_if_ready(server: &Server, session: &mut Session) -> Vec<Message> {
    match &session.nick {
        Some(nick) if session.user && !session.welcomed => {
            session.welcomed = true;
            info!("{} registered", nick);
            vec![server_message(
                &server.name,
                REPLY_WELCOME,
                [nick.clone(), format!("Welcome to the network {nick}")],
            )]
        }
        _ => Vec::new(),
    }
}

fn server_message<I, P>(server: &str, command: &str, params: I) -> Message
where
    I: IntoIterator<Item = P>,
    P: Into<String>,
{
    Message {
        prefix: Some(server.to_string()),
        ..Message::new(command, params)
    }
}

fn user_prefix(nick: &str) -> String {
    format!("{nick}!{nick}@127.0.0.1")
}
