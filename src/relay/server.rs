//! Broker core — session and channel registries, command dispatch, fan-out.
//!
//! One accept loop, one task per session, one liveness task. Every piece of
//! mutable state lives in a single [`ServerState`] behind an `RwLock`, so
//! registry mutations are serialized under one exclusive discipline. Each
//! session drains its own FIFO outbound queue, which preserves per-session
//! delivery order; eviction closes the queue after the final `quit`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::{LineCodec, RawFrame};
use super::liveness;
use super::message::{self, Command, ErrorKind, Frame, Reply};
use super::nick::{self, NEW_USER_NICK, SERVER_NICK};

/// Hard cap on concurrent sessions; connections beyond it are refused.
pub const MAX_SESSIONS: usize = 1024;

/// Entries per `names`/`channels` reply chunk.
const CHUNK: usize = 5;

/// Broker configuration. The liveness knobs exist so tests can compress
/// time; the defaults match the protocol (100 ms tick, ping rounds no more
/// often than every 2 s and 2 ticks).
#[derive(Debug, Clone)]
pub struct Config {
    pub hostname: String,
    pub port: u16,
    pub tick: Duration,
    pub ping_round: Duration,
    pub min_ticks: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            port: 50000,
            tick: Duration::from_millis(100),
            ping_round: Duration::from_secs(2),
            min_ticks: 2,
        }
    }
}

/// Events delivered to a session task over its outbound queue.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Put a frame on the wire.
    Deliver(Frame),
    /// Flush and close the connection.
    Close,
}

/// One connected session, owned by the registry and keyed by nickname.
#[derive(Debug)]
pub(crate) struct SessionHandle {
    pub addr: SocketAddr,
    pub tx: mpsc::UnboundedSender<SessionEvent>,
    /// Channels this session has joined; mirror of the channel member sets.
    pub channels: HashSet<String>,
    /// Payload of the unanswered ping, if any. At most one outstanding.
    pub pending_ping: Option<String>,
}

/// All broker state. Mutated only under the write lock.
#[derive(Debug, Default)]
pub(crate) struct ServerState {
    pub sessions: HashMap<String, SessionHandle>,
    pub channels: HashMap<String, HashSet<String>>,
    pub stopping: bool,
}

pub(crate) type SharedState = Arc<RwLock<ServerState>>;

impl ServerState {
    /// Admit a new connection: pick a free nickname, register the session,
    /// and queue the `nick` command renaming `NEWUSER` to the assignment.
    fn register(
        &mut self,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Option<String> {
        if self.stopping || self.sessions.len() >= MAX_SESSIONS {
            return None;
        }
        let name = nick::generate(|candidate| self.sessions.contains_key(candidate))?;
        self.sessions.insert(
            name.clone(),
            SessionHandle {
                addr,
                tx,
                channels: HashSet::new(),
                pending_ping: None,
            },
        );
        self.deliver_one(
            &name,
            Frame::Command(Command::Nick {
                src: NEW_USER_NICK.into(),
                update: name.clone(),
            }),
        );
        Some(name)
    }

    /// Enqueue one frame to one session, if it is still registered.
    pub(crate) fn deliver_one(&self, name: &str, frame: Frame) {
        if let Some(handle) = self.sessions.get(name) {
            let _ = handle.tx.send(SessionEvent::Deliver(frame));
        }
    }

    /// Expand a target list (nicknames and channel names) into the
    /// deduplicated set of destination sessions.
    fn resolve<'a>(&self, targets: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        let mut out = HashSet::new();
        for target in targets {
            if let Some(members) = self.channels.get(target) {
                out.extend(members.iter().cloned());
            } else if self.sessions.contains_key(target) {
                out.insert(target.to_owned());
            }
        }
        out
    }

    /// Enqueue exactly one copy of `frame` to every destination `targets`
    /// expands to. Empty expansions are fine.
    fn fan_out<'a>(&self, targets: impl IntoIterator<Item = &'a str>, frame: &Frame) {
        for dest in self.resolve(targets) {
            self.deliver_one(&dest, frame.clone());
        }
    }

    /// Tear a session down: announce the quit to its channels, detach it
    /// from every member set, and close its queue after one final `quit`
    /// (attributed to `SERVER` when the eviction is server-initiated).
    /// Emptied channels linger until the liveness sweep.
    pub(crate) fn evict(&mut self, name: &str, reason: &str, from_server: bool) {
        let Some(handle) = self.sessions.remove(name) else {
            return;
        };
        for chan in &handle.channels {
            if let Some(members) = self.channels.get_mut(chan) {
                members.remove(name);
            }
        }
        let announcement = Frame::Command(Command::Quit {
            src: name.to_owned(),
            msg: reason.to_owned(),
        });
        self.fan_out(handle.channels.iter().map(String::as_str), &announcement);

        let src = if from_server { SERVER_NICK } else { name };
        let _ = handle.tx.send(SessionEvent::Deliver(Frame::Command(Command::Quit {
            src: src.to_owned(),
            msg: reason.to_owned(),
        })));
        let _ = handle.tx.send(SessionEvent::Close);
        info!(nick = name, addr = %handle.addr, reason, "session evicted");
    }

    /// Ordered teardown: stop admitting sessions and evict every live one.
    pub(crate) fn shutdown(&mut self) {
        self.stopping = true;
        let names: Vec<String> = self.sessions.keys().cloned().collect();
        for name in names {
            self.evict(&name, "Server Shutdown", true);
        }
        self.channels.clear();
    }

    // ── Command handlers ─────────────────────────────────────────

    /// Rename atomically and announce to the session plus its channels.
    fn handle_nick(&mut self, name: &str, update: String) -> Option<String> {
        if !self.sessions.contains_key(name) {
            return None;
        }
        if !nick::is_valid(&update)
            || nick::is_reserved(&update)
            || self.sessions.contains_key(&update)
        {
            self.deliver_one(
                name,
                Frame::error(ErrorKind::BadNick, format!("nickname {update} is unavailable")),
            );
            return None;
        }
        let Some(handle) = self.sessions.remove(name) else {
            return None;
        };
        let channels: Vec<String> = handle.channels.iter().cloned().collect();
        for chan in &channels {
            if let Some(members) = self.channels.get_mut(chan) {
                members.remove(name);
                members.insert(update.clone());
            }
        }
        self.sessions.insert(update.clone(), handle);

        let frame = Frame::Command(Command::Nick {
            src: name.to_owned(),
            update: update.clone(),
        });
        let mut dests = self.resolve(channels.iter().map(String::as_str));
        dests.insert(update.clone());
        for dest in &dests {
            self.deliver_one(dest, frame.clone());
        }
        info!(from = name, to = %update, "nickname changed");
        Some(update)
    }

    /// All-or-nothing join: one existing membership fails the whole command.
    fn handle_join(&mut self, name: &str, channels: &[String]) {
        let Some(handle) = self.sessions.get(name) else {
            return;
        };
        if let Some(already) = channels.iter().find(|c| handle.channels.contains(c.as_str())) {
            self.deliver_one(
                name,
                Frame::error(ErrorKind::Member, format!("already a member of {already}")),
            );
            return;
        }
        for chan in channels {
            self.channels
                .entry(chan.clone())
                .or_default()
                .insert(name.to_owned());
            if let Some(handle) = self.sessions.get_mut(name) {
                handle.channels.insert(chan.clone());
            }
            let frame = Frame::Command(Command::Join {
                src: name.to_owned(),
                channels: vec![chan.clone()],
            });
            self.fan_out([chan.as_str()], &frame);
        }
        for chan in channels {
            self.send_names(name, chan, false);
        }
        debug!(nick = name, ?channels, "joined");
    }

    /// All-or-nothing leave: every channel must exist and be joined.
    /// The announcement fans before removal so the leaver hears it too.
    fn handle_leave(&mut self, name: &str, channels: &[String], msg: &str) {
        let Some(handle) = self.sessions.get(name) else {
            return;
        };
        if let Some(missing) = channels.iter().find(|c| !self.channels.contains_key(c.as_str())) {
            self.deliver_one(
                name,
                Frame::error(ErrorKind::NoChannel, format!("no such channel {missing}")),
            );
            return;
        }
        if let Some(outside) = channels.iter().find(|c| !handle.channels.contains(c.as_str())) {
            self.deliver_one(
                name,
                Frame::error(ErrorKind::NonMember, format!("not a member of {outside}")),
            );
            return;
        }
        for chan in channels {
            let frame = Frame::Command(Command::Leave {
                src: name.to_owned(),
                channels: vec![chan.clone()],
                msg: msg.to_owned(),
            });
            self.fan_out([chan.as_str()], &frame);
            if let Some(members) = self.channels.get_mut(chan) {
                members.remove(name);
            }
            if let Some(handle) = self.sessions.get_mut(name) {
                handle.channels.remove(chan);
            }
        }
        debug!(nick = name, ?channels, "left");
    }

    /// Full channel list, chunked, to the requester.
    fn handle_channels(&self, name: &str) {
        let mut list: Vec<String> = self.channels.keys().cloned().collect();
        list.sort();
        for chunk in list.chunks(CHUNK) {
            self.deliver_one(
                name,
                Frame::Reply(Reply::Channels {
                    channels: chunk.to_vec(),
                }),
            );
        }
        self.deliver_one(name, Frame::Reply(Reply::Channels { channels: Vec::new() }));
    }

    /// Member lists for the requested channels (all channels when omitted),
    /// chunked per channel; `client` mirrors the request.
    fn handle_users(&self, name: &str, channels: Option<&[String]>, client: bool) {
        let requested: Vec<String> = match channels {
            Some(list) => {
                if let Some(missing) =
                    list.iter().find(|c| !self.channels.contains_key(c.as_str()))
                {
                    self.deliver_one(
                        name,
                        Frame::error(ErrorKind::NoChannel, format!("no such channel {missing}")),
                    );
                    return;
                }
                list.to_vec()
            }
            None => {
                let mut all: Vec<String> = self.channels.keys().cloned().collect();
                all.sort();
                all
            }
        };
        for chan in &requested {
            self.send_names(name, chan, client);
        }
    }

    /// Relay to the deduplicated union of targets. Channel targets require
    /// membership; every target must resolve before anything is sent.
    fn handle_msg(&self, name: &str, targets: &[String], msg: &str) {
        for target in targets {
            if let Some(members) = self.channels.get(target) {
                if !members.contains(name) {
                    self.deliver_one(
                        name,
                        Frame::error(ErrorKind::NonMember, format!("not a member of {target}")),
                    );
                    return;
                }
            } else if !self.sessions.contains_key(target) {
                self.deliver_one(
                    name,
                    Frame::error(
                        ErrorKind::NonExist,
                        format!("no such nick or channel {target}"),
                    ),
                );
                return;
            }
        }
        let frame = Frame::Command(Command::Msg {
            src: name.to_owned(),
            targets: targets.to_vec(),
            msg: msg.to_owned(),
        });
        self.fan_out(targets.iter().map(String::as_str), &frame);
    }

    /// A pong must match the outstanding ping exactly; anything else is a
    /// liveness failure. Returns false when the session was evicted.
    fn handle_pong(&mut self, name: &str, payload: &str) -> bool {
        let Some(handle) = self.sessions.get_mut(name) else {
            return false;
        };
        if handle.pending_ping.as_deref() == Some(payload) {
            handle.pending_ping = None;
            true
        } else {
            self.evict(name, "Unexpected Pong", true);
            false
        }
    }

    /// Sorted member list of one channel, in chunks of five, terminated by
    /// an empty `names` reply.
    fn send_names(&self, to: &str, chan: &str, client: bool) {
        let mut names: Vec<String> = self
            .channels
            .get(chan)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        for chunk in names.chunks(CHUNK) {
            self.deliver_one(
                to,
                Frame::Reply(Reply::Names {
                    channel: chan.to_owned(),
                    names: chunk.to_vec(),
                    client,
                }),
            );
        }
        self.deliver_one(
            to,
            Frame::Reply(Reply::Names {
                channel: chan.to_owned(),
                names: Vec::new(),
                client,
            }),
        );
    }
}

/// The broker: a bound listener plus the shared registries.
pub struct Broker {
    listener: TcpListener,
    state: SharedState,
    cfg: Config,
}

impl Broker {
    /// Bind the listen socket. Failing here lets the caller exit nonzero
    /// before any session exists.
    pub async fn bind(cfg: Config) -> io::Result<Self> {
        let listener = TcpListener::bind((cfg.hostname.as_str(), cfg.port)).await?;
        info!(addr = %listener.local_addr()?, "broker listening");
        Ok(Self {
            listener,
            state: Arc::default(),
            cfg,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve sessions until `shutdown` resolves, then run the
    /// ordered teardown: close the listener, evict every session with a
    /// final `quit` from `SERVER`, and wait for the session tasks to flush.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let Broker { listener, state, cfg } = self;
        let liveness = tokio::spawn(liveness::run(Arc::clone(&state), cfg));
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        info!(%addr, "new connection");
                        sessions.spawn(handle_session(socket, addr, Arc::clone(&state)));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }

        info!("broker stopping");
        drop(listener);
        liveness.abort();
        state.write().await.shutdown();
        while sessions.join_next().await.is_some() {}
        Ok(())
    }
}

enum Outcome {
    Continue,
    Evicted,
}

/// Serve one connection until it quits, errors out, or is evicted.
async fn handle_session(socket: TcpStream, addr: SocketAddr, state: SharedState) {
    let mut framed = Framed::new(socket, LineCodec::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let registered = state.write().await.register(addr, tx);
    let Some(mut name) = registered else {
        warn!(%addr, "registry full, refusing connection");
        return;
    };
    info!(%addr, nick = %name, "session registered");

    let mut evicted = false;
    while !evicted {
        tokio::select! {
            inbound = framed.next() => match inbound {
                Some(Ok(RawFrame::Line(line))) => match message::decode(&line) {
                    Ok(Frame::Command(cmd)) => {
                        if let Outcome::Evicted = dispatch(&state, &mut name, cmd).await {
                            evicted = true;
                        }
                    }
                    Ok(_) => {
                        state
                            .read()
                            .await
                            .deliver_one(&name, Frame::error(ErrorKind::Schema, "not a client command"));
                    }
                    Err(e) => {
                        debug!(nick = %name, "rejected frame: {e}");
                        state
                            .read()
                            .await
                            .deliver_one(&name, Frame::error(ErrorKind::Schema, e.to_string()));
                    }
                },
                Some(Ok(RawFrame::Oversize)) => {
                    state
                        .read()
                        .await
                        .deliver_one(&name, Frame::error(ErrorKind::Schema, "frame exceeds 1024 bytes"));
                }
                Some(Err(e)) => {
                    warn!(nick = %name, "transport error: {e}");
                    state.write().await.evict(&name, "Connection Drop", true);
                    evicted = true;
                }
                None => {
                    state.write().await.evict(&name, "Connection Drop", true);
                    evicted = true;
                }
            },
            outbound = rx.recv() => match outbound {
                Some(SessionEvent::Deliver(frame)) => {
                    if let Err(e) = framed.send(frame).await {
                        warn!(nick = %name, "send failed: {e}");
                        state.write().await.evict(&name, "Connection Drop", true);
                        evicted = true;
                    }
                }
                Some(SessionEvent::Close) | None => break,
            },
        }
    }

    // Flush whatever the eviction queued (the final quit) onto the wire.
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::Deliver(frame) => {
                if framed.send(frame).await.is_err() {
                    break;
                }
            }
            SessionEvent::Close => break,
        }
    }
    info!(nick = %name, "session closed");
}

/// Route one validated command to its handler. `name` tracks the session's
/// current nickname across renames.
async fn dispatch(state: &SharedState, name: &mut String, cmd: Command) -> Outcome {
    // Anti-spoofing: src must be the sender's current nickname.
    if cmd.src() != name.as_str() {
        state
            .read()
            .await
            .deliver_one(name, Frame::error(ErrorKind::Schema, "src does not match your nickname"));
        return Outcome::Continue;
    }
    match cmd {
        Command::Nick { update, .. } => {
            if let Some(new) = state.write().await.handle_nick(name, update) {
                *name = new;
            }
        }
        Command::Join { channels, .. } => state.write().await.handle_join(name, &channels),
        Command::Leave { channels, msg, .. } => {
            state.write().await.handle_leave(name, &channels, &msg)
        }
        Command::Channels { .. } => state.read().await.handle_channels(name),
        Command::Users { channels, client, .. } => {
            state.read().await.handle_users(name, channels.as_deref(), client)
        }
        Command::Msg { targets, msg, .. } => state.read().await.handle_msg(name, &targets, &msg),
        Command::Quit { msg, .. } => {
            state.write().await.evict(name, &msg, false);
            return Outcome::Evicted;
        }
        // The broker never answers client pings.
        Command::Ping { .. } => {}
        Command::Pong { msg, .. } => {
            if !state.write().await.handle_pong(name, &msg) {
                return Outcome::Evicted;
            }
        }
    }
    Outcome::Continue
}
