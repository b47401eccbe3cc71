//! Command Handler Module
//!
//! Interprets decoded requests against the keyspace and the replication
//! manager.
//!
//! ## Supported Commands
//!
//! - `PING [message]` - Liveness check, always `+PONG`
//! - `ECHO message` - Echo message
//! - `SET key value [PX milliseconds | EX seconds]` - Set a key
//! - `GET key` - Get a key's value
//! - `INFO [replication]` - Replication status
//! - `REPLCONF listening-port <port> | capa <capability>...` - Replica handshake
//! - `PSYNC <replid> <offset>` - Start a full resync (master only)
//!
//! ## Client Mode and Replica Stream Mode
//!
//! [`CommandHandler::execute`] serves a client connection and always
//! produces a reply (or, for PSYNC, a [`FullResync`] that the connection
//! turns into a replica session).
//!
//! [`CommandHandler::apply_replicated`] applies a command received from
//! this node's master. Nothing is replied and nothing is propagated.

use crate::protocol::{Command, RespValue};
use crate::replication::{FullResync, LinkState, ReplicationManager, Role};
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Per-connection state the dispatcher may read or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub peer: SocketAddr,
    /// Port advertised through `REPLCONF listening-port`
    pub listening_port: Option<u16>,
}

impl ConnectionContext {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            listening_port: None,
        }
    }
}

/// The result of executing a client command.
#[derive(Debug)]
pub enum CommandOutcome {
    /// Send this reply and keep serving the client.
    Reply(RespValue),
    /// The connection becomes a replica session.
    FullResync(FullResync),
}

impl From<RespValue> for CommandOutcome {
    fn from(reply: RespValue) -> Self {
        CommandOutcome::Reply(reply)
    }
}

/// A parsed `SET` request.
#[derive(Debug)]
struct SetRequest {
    key: Bytes,
    value: Bytes,
    ttl: Option<Duration>,
}

/// Handles commands by dispatching them to the appropriate handlers.
#[derive(Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
    replication: Arc<ReplicationManager>,
}

impl CommandHandler {
    pub fn new(replication: Arc<ReplicationManager>) -> Self {
        Self {
            storage: Arc::clone(replication.storage()),
            replication,
        }
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    /// Executes a client command.
    ///
    /// Errors are returned as RESP error replies; a bad command never ends
    /// the connection.
    pub fn execute(&self, command: &Command, ctx: &mut ConnectionContext) -> CommandOutcome {
        let args = command.args();

        let reply = match command.name() {
            "PING" => self.cmd_ping(args),
            "ECHO" => self.cmd_echo(args),
            "SET" => self.cmd_set(command),
            "GET" => self.cmd_get(args),
            "INFO" => self.cmd_info(args),
            "REPLCONF" => self.cmd_replconf(args, ctx),
            "PSYNC" => return self.cmd_psync(args, ctx),
            name => RespValue::error(format!("ERR unknown command '{}'", name)),
        };

        CommandOutcome::Reply(reply)
    }

    /// Applies a command read from this node's master.
    pub fn apply_replicated(&self, command: &Command) {
        match command.name() {
            "SET" => match parse_set(command.args()) {
                Ok(request) => {
                    self.storage
                        .set_entry(request.key, request.value, request.ttl);
                }
                Err(reply) => {
                    warn!(error = %reply, "Rejected replicated SET");
                }
            },
            // Heartbeats from the master
            "PING" | "REPLCONF" => trace!(command = command.name(), "Replication heartbeat"),
            name => warn!(command = name, "Ignoring unsupported replicated command"),
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, _args: &[Bytes]) -> RespValue {
        RespValue::pong()
    }

    /// ECHO message
    fn cmd_echo(&self, args: &[Bytes]) -> RespValue {
        match args {
            [message] => RespValue::bulk_string(message.clone()),
            _ => wrong_arity("echo"),
        }
    }

    /// SET key value [PX milliseconds | EX seconds]
    fn cmd_set(&self, command: &Command) -> RespValue {
        let request = match parse_set(command.args()) {
            Ok(request) => request,
            Err(reply) => return reply,
        };

        self.replication.commit_write(&command.to_resp(), move |store| {
            store.set_entry(request.key, request.value, request.ttl)
        });
        RespValue::ok()
    }

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> RespValue {
        match args {
            [key] => match self.storage.get(key) {
                Some(value) => RespValue::bulk_string(value),
                None => RespValue::null(),
            },
            _ => wrong_arity("get"),
        }
    }

    /// INFO [section]
    fn cmd_info(&self, args: &[Bytes]) -> RespValue {
        let wants_replication = match args {
            [] => true,
            [section] => ["replication", "all", "default", "everything"]
                .iter()
                .any(|name| section.eq_ignore_ascii_case(name.as_bytes())),
            _ => return RespValue::error("ERR syntax error"),
        };

        if wants_replication {
            RespValue::bulk_string(self.replication_info())
        } else {
            RespValue::bulk_string(Bytes::new())
        }
    }

    /// REPLCONF <option> <value> [<option> <value> ...]
    fn cmd_replconf(&self, args: &[Bytes], ctx: &mut ConnectionContext) -> RespValue {
        let Some(option) = args.first() else {
            return wrong_arity("replconf");
        };

        let option = String::from_utf8_lossy(option).to_lowercase();
        match option.as_str() {
            "listening-port" => {
                let [_, port] = args else {
                    return wrong_arity("replconf");
                };
                match parse_integer(port).and_then(|p| u16::try_from(p).ok()) {
                    Some(port) => {
                        ctx.listening_port = Some(port);
                        RespValue::ok()
                    }
                    None => RespValue::error("ERR value is not a valid port"),
                }
            }
            "capa" => {
                if args.len() < 2 {
                    return wrong_arity("replconf");
                }
                RespValue::ok()
            }
            _ => RespValue::error(format!("ERR Unrecognized REPLCONF option: {}", option)),
        }
    }

    /// PSYNC <replid> <offset>
    ///
    /// Partial resynchronization is not supported: every PSYNC is answered
    /// with a full resync.
    fn cmd_psync(&self, args: &[Bytes], ctx: &ConnectionContext) -> CommandOutcome {
        let [_, offset] = args else {
            return wrong_arity("psync").into();
        };
        if parse_integer(offset).is_none() {
            return RespValue::error("ERR value is not an integer or out of range").into();
        }

        match self
            .replication
            .begin_full_resync(ctx.peer, ctx.listening_port)
        {
            Ok(resync) => CommandOutcome::FullResync(resync),
            Err(e) => RespValue::error(format!("ERR {}", e)).into(),
        }
    }

    // ========================================================================
    // Helper functions
    // ========================================================================

    fn replication_info(&self) -> String {
        let state = self.replication.state();
        let mut lines = vec![
            "# Replication".to_string(),
            format!("role:{}", state.role().as_info_str()),
        ];

        match state.role() {
            Role::Master => {
                let sessions = self.replication.sessions();
                lines.push(format!("connected_slaves:{}", sessions.len()));
                for (index, session) in sessions.iter().enumerate() {
                    let port = session.listening_port.unwrap_or(session.peer.port());
                    lines.push(format!(
                        "slave{}:ip={},port={},state=online",
                        index,
                        session.peer.ip(),
                        port
                    ));
                }
                lines.push(format!("master_replid:{}", state.replication_id()));
                lines.push(format!("master_repl_offset:{}", state.master_offset()));
            }
            Role::Replica(master) => {
                let link = state.link_state();
                let link_status = if link == LinkState::Streaming { "up" } else { "down" };
                let syncing = matches!(link, LinkState::Handshaking | LinkState::ReceivingSnapshot);
                let replid = state
                    .upstream_replication_id()
                    .unwrap_or_else(|| state.replication_id().to_string());

                lines.push(format!("master_host:{}", master.host));
                lines.push(format!("master_port:{}", master.port));
                lines.push(format!("master_link_status:{}", link_status));
                lines.push(format!("master_sync_in_progress:{}", u8::from(syncing)));
                lines.push(format!("slave_repl_offset:{}", state.processed_offset()));
                lines.push(format!("master_replid:{}", replid));
                lines.push(format!("master_repl_offset:{}", state.processed_offset()));
            }
        }

        let mut info = lines.join("\r\n");
        info.push_str("\r\n");
        info
    }
}

fn wrong_arity(command: &str) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        command
    ))
}

fn parse_integer(value: &Bytes) -> Option<i64> {
    std::str::from_utf8(value).ok()?.parse().ok()
}

/// Parses `key value [PX ms | EX s]`.
fn parse_set(args: &[Bytes]) -> Result<SetRequest, RespValue> {
    let [key, value, options @ ..] = args else {
        return Err(wrong_arity("set"));
    };

    let mut ttl = None;
    let mut options = options.iter();
    while let Some(option) = options.next() {
        let to_duration: fn(u64) -> Duration = if option.eq_ignore_ascii_case(b"PX") {
            Duration::from_millis
        } else if option.eq_ignore_ascii_case(b"EX") {
            Duration::from_secs
        } else {
            return Err(RespValue::error("ERR syntax error"));
        };

        let amount = options
            .next()
            .ok_or_else(|| RespValue::error("ERR syntax error"))?;
        match parse_integer(amount) {
            Some(n) if n > 0 => ttl = Some(to_duration(n as u64)),
            _ => return Err(RespValue::error("ERR invalid expire time in 'set' command")),
        }
    }

    Ok(SetRequest {
        key: key.clone(),
        value: value.clone(),
        ttl,
    })
}
