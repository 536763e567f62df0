//! Line protocol over TCP.
//!
//! ```text
//! HELLO <client-id>          attach every registered store for the client
//! GET <store>                working representation as JSON
//! SET <store> <field> <json> stage one document field
//! SCORE <store> <n>          stage a sorted value
//! SAVE <store>               save now
//! TOP <store> [n]            highest n sorted entries (default 10)
//! QUIT
//! ```
//!
//! Replies are `OK [payload]` or `ERR <message>`. A client dropped by the
//! server receives `BYE <reason>` before the socket closes.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use playerstore::backend::Backend;
use playerstore::{
    ClientConnection, ClientId, ClientRecord, ConnectionState, DataStores, Document, RecordHandle,
    RecordKind, StoreError,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

const DEFAULT_TOP: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Hello(u64),
    Get(String),
    Set {
        store: String,
        field: String,
        value: Value,
    },
    Score {
        store: String,
        value: i64,
    },
    Save(String),
    Top {
        store: String,
        count: u32,
    },
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0}")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid {what}: {detail}")]
    Invalid { what: &'static str, detail: String },
}

/// Parse one protocol line. The JSON value of `SET` may contain spaces.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let mut args = rest.split_whitespace();

    match verb.to_ascii_uppercase().as_str() {
        "" => Err(ParseError::Empty),
        "HELLO" => {
            let id = single(&mut args, "HELLO <client-id>")?;
            let id = id.parse().map_err(|_| ParseError::Invalid {
                what: "client id",
                detail: id.to_string(),
            })?;
            Ok(Command::Hello(id))
        }
        "GET" => Ok(Command::Get(single(&mut args, "GET <store>")?.to_string())),
        "SAVE" => Ok(Command::Save(single(&mut args, "SAVE <store>")?.to_string())),
        "SET" => {
            const USAGE: &str = "SET <store> <field> <json>";
            let mut parts = rest.splitn(3, char::is_whitespace);
            let (Some(store), Some(field), Some(raw)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(ParseError::Usage(USAGE));
            };
            if store.is_empty() || field.is_empty() || raw.trim().is_empty() {
                return Err(ParseError::Usage(USAGE));
            }
            let value = serde_json::from_str(raw.trim()).map_err(|e| ParseError::Invalid {
                what: "json",
                detail: e.to_string(),
            })?;
            Ok(Command::Set {
                store: store.to_string(),
                field: field.to_string(),
                value,
            })
        }
        "SCORE" => {
            const USAGE: &str = "SCORE <store> <n>";
            let (Some(store), Some(raw), None) = (args.next(), args.next(), args.next()) else {
                return Err(ParseError::Usage(USAGE));
            };
            let value = raw.parse().map_err(|_| ParseError::Invalid {
                what: "score",
                detail: raw.to_string(),
            })?;
            Ok(Command::Score {
                store: store.to_string(),
                value,
            })
        }
        "TOP" => {
            const USAGE: &str = "TOP <store> [n]";
            let Some(store) = args.next() else {
                return Err(ParseError::Usage(USAGE));
            };
            let count = match (args.next(), args.next()) {
                (None, _) => DEFAULT_TOP,
                (Some(raw), None) => raw.parse().map_err(|_| ParseError::Invalid {
                    what: "count",
                    detail: raw.to_string(),
                })?,
                (Some(_), Some(_)) => return Err(ParseError::Usage(USAGE)),
            };
            Ok(Command::Top {
                store: store.to_string(),
                count,
            })
        }
        "QUIT" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

fn single<'a>(
    args: &mut impl Iterator<Item = &'a str>,
    usage: &'static str,
) -> Result<&'a str, ParseError> {
    match (args.next(), args.next()) {
        (Some(arg), None) => Ok(arg),
        _ => Err(ParseError::Usage(usage)),
    }
}

/// The stores every client gets attached to, in registration order.
pub struct StoreService<B> {
    handles: Vec<RecordHandle<B>>,
    autosave: Option<Duration>,
}

impl<B: Backend> StoreService<B> {
    /// Register the game's stores: `Gold` (document) and `Kills` (sorted).
    pub async fn register(stores: &DataStores<B>) -> Result<Self, StoreError> {
        let gold_schema = serde_json::json!({ "coins": 0, "level": 1 });
        let gold = stores
            .get_data_store("Gold", RecordKind::Document, gold_schema.as_object().cloned())
            .await?;
        let kills = stores
            .get_data_store("Kills", RecordKind::SortedNumeric, None)
            .await?;

        Ok(Self {
            handles: vec![gold, kills],
            autosave: stores.config().autosave_interval,
        })
    }

    fn handle(&self, store: &str) -> Option<&RecordHandle<B>> {
        self.handles.iter().find(|h| h.name() == store)
    }

    /// Attach every store. On failure the connection has already been kicked
    /// and records attached so far finish on their own.
    async fn attach_all(
        &self,
        connection: &ClientConnection,
    ) -> Result<HashMap<String, ClientRecord>, StoreError> {
        let mut records = HashMap::new();
        for handle in &self.handles {
            let record = handle.attach(connection, self.autosave).await?;
            records.insert(handle.name().to_string(), record);
        }
        Ok(records)
    }

    async fn execute(
        &self,
        records: &HashMap<String, ClientRecord>,
        command: Command,
    ) -> Result<String, String> {
        let payload = match command {
            Command::Hello(_) => return Err("already attached".into()),
            Command::Quit => String::new(),
            Command::Get(store) => {
                let value = attached(records, &store)?
                    .snapshot()
                    .await
                    .map_err(|e| e.to_string())?;
                to_json(&value)?
            }
            Command::Set {
                store,
                field,
                value,
            } => {
                let mut patch = Document::new();
                patch.insert(field, value);
                let value = attached(records, &store)?
                    .update(patch)
                    .await
                    .map_err(|e| e.to_string())?;
                to_json(&value)?
            }
            Command::Score { store, value } => {
                attached(records, &store)?
                    .set_number(value)
                    .await
                    .map_err(|e| e.to_string())?;
                String::new()
            }
            Command::Save(store) => {
                attached(records, &store)?
                    .save()
                    .await
                    .map_err(|e| e.to_string())?;
                String::new()
            }
            Command::Top { store, count } => {
                let handle = self
                    .handle(&store)
                    .ok_or_else(|| format!("unknown store {}", store))?;
                let pages = handle
                    .sorted_range(false, count, None, None)
                    .await
                    .map_err(|e| e.to_string())?;
                to_json(pages.current_page())?
            }
        };
        Ok(payload)
    }
}

fn attached<'a>(
    records: &'a HashMap<String, ClientRecord>,
    store: &str,
) -> Result<&'a ClientRecord, String> {
    records
        .get(store)
        .ok_or_else(|| format!("unknown store {}", store))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| e.to_string())
}

/// Accept connections until `shutdown` resolves.
pub async fn serve<B, F>(
    listener: TcpListener,
    service: Arc<StoreService<B>>,
    shutdown: F,
) -> anyhow::Result<()>
where
    B: Backend,
    F: Future<Output = ()> + Send,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received; no longer accepting clients");
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(inner) => inner,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_socket(service, socket, peer).await {
                        tracing::debug!(%peer, error = %e, "Connection terminated");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_socket<B: Backend>(
    service: Arc<StoreService<B>>,
    socket: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let (read, mut write) = socket.into_split();
    let mut lines = LinesStream::new(BufReader::new(read).lines());

    let client = loop {
        let Some(line) = lines.next().await.transpose()? else {
            return Ok(());
        };
        match parse_command(&line) {
            Ok(Command::Hello(id)) => break ClientId(id),
            Ok(Command::Quit) => return Ok(()),
            Ok(_) => reply(&mut write, Err("say HELLO first".into())).await?,
            Err(e) => reply(&mut write, Err(e.to_string())).await?,
        }
    };
    tracing::info!(%peer, %client, "Client connected");

    let connection = ClientConnection::new(client);
    let mut early: Vec<std::io::Result<String>> = Vec::new();
    let attached = {
        let attach = service.attach_all(&connection);
        tokio::pin!(attach);
        let mut reading = true;
        loop {
            tokio::select! {
                result = &mut attach => break result,
                line = lines.next(), if reading => match line {
                    Some(Ok(line)) => early.push(Ok(line)),
                    // The client left; cancel any session start still in flight.
                    _ => {
                        reading = false;
                        connection.disconnect();
                    }
                },
            }
        }
    };
    let records = match attached {
        Ok(records) => records,
        Err(e) => {
            bye(&mut write, &connection, &e.to_string()).await?;
            return Ok(());
        }
    };
    reply(&mut write, Ok(format!("hello {}", client))).await?;

    // Lines sent while attaching are answered first.
    let mut lines = tokio_stream::iter(early).chain(lines);
    let result = client_loop(&service, &records, &connection, &mut lines, &mut write).await;

    // Closing the connection runs each record's final save.
    connection.disconnect();
    for record in records.values() {
        record.wait_stopped().await;
    }
    tracing::info!(%peer, %client, "Client left");
    result
}

async fn client_loop<B, L>(
    service: &StoreService<B>,
    records: &HashMap<String, ClientRecord>,
    connection: &ClientConnection,
    lines: &mut L,
    write: &mut OwnedWriteHalf,
) -> anyhow::Result<()>
where
    B: Backend,
    L: tokio_stream::Stream<Item = std::io::Result<String>> + Unpin,
{
    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line.transpose()? else {
                    return Ok(());
                };
                let outcome = match parse_command(&line) {
                    Ok(Command::Quit) => {
                        reply(write, Ok(String::new())).await?;
                        return Ok(());
                    }
                    Ok(command) => service.execute(records, command).await,
                    Err(e) => Err(e.to_string()),
                };
                reply(write, outcome).await?;
            }
            _ = connection.closed() => {
                if let ConnectionState::Disconnected { reason: Some(reason) } = connection.state() {
                    bye(write, connection, &reason).await?;
                }
                return Ok(());
            }
        }
    }
}

async fn reply(write: &mut OwnedWriteHalf, outcome: Result<String, String>) -> std::io::Result<()> {
    let line = match outcome {
        Ok(payload) if payload.is_empty() => "OK\n".to_string(),
        Ok(payload) => format!("OK {}\n", payload),
        Err(message) => format!("ERR {}\n", message),
    };
    write.write_all(line.as_bytes()).await
}

async fn bye(
    write: &mut OwnedWriteHalf,
    connection: &ClientConnection,
    fallback: &str,
) -> std::io::Result<()> {
    let reason = match connection.state() {
        ConnectionState::Disconnected {
            reason: Some(reason),
        } => reason,
        _ => fallback.to_string(),
    };
    write.write_all(format!("BYE {}\n", reason).as_bytes()).await
}
