// Digital Voice Modem - Fixed Network Equipment
// Core protocol engine for DMR/P25 repeater traffic routing.
//
// Reporting Channel: length-prefixed TCP push/pull interface for external
// monitoring tools (config/rules/affiliation/whitelist snapshots, call
// events, and an RCON shell-out).

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::sink::SinkExt;
use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::{FneError, FneResult};
use crate::router::CallEvent;

/// Reporting-channel opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOpcode {
    RequestConfig,
    ConfigSnapshot,
    RulesSnapshot,
    CallEvent,
    AffiliationSnapshot,
    Rcon,
    WhitelistSnapshot,
}

impl ReportOpcode {
    fn code(self) -> u8 {
        match self {
            ReportOpcode::RequestConfig => 0x00,
            ReportOpcode::ConfigSnapshot => 0x01,
            ReportOpcode::RulesSnapshot => 0x03,
            ReportOpcode::CallEvent => 0x07,
            ReportOpcode::AffiliationSnapshot => 0x08,
            ReportOpcode::Rcon => 0x09,
            ReportOpcode::WhitelistSnapshot => 0x10,
        }
    }

    fn from_code(code: u8) -> FneResult<Self> {
        match code {
            0x00 => Ok(ReportOpcode::RequestConfig),
            0x01 => Ok(ReportOpcode::ConfigSnapshot),
            0x03 => Ok(ReportOpcode::RulesSnapshot),
            0x07 => Ok(ReportOpcode::CallEvent),
            0x08 => Ok(ReportOpcode::AffiliationSnapshot),
            0x09 => Ok(ReportOpcode::Rcon),
            0x10 => Ok(ReportOpcode::WhitelistSnapshot),
            _ => Err(FneError::UnknownOpcode(vec![code])),
        }
    }
}

/// A decoded reporting-channel message: opcode plus an ASCII body.
#[derive(Debug, Clone)]
pub struct ReportFrame {
    pub opcode: ReportOpcode,
    pub body: String,
}

impl ReportFrame {
    pub fn new(opcode: ReportOpcode, body: impl Into<String>) -> Self {
        Self {
            opcode,
            body: body.into(),
        }
    }

    fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.body.len());
        buf.put_u8(self.opcode.code());
        buf.put_slice(self.body.as_bytes());
        buf.freeze()
    }
}

/// Netstring-like framing: `<decimal length>:<payload>,`, where `length` is
/// the byte length of `payload`.
#[derive(Debug, Default)]
pub struct NetstringCodec;

impl Decoder for NetstringCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, Self::Error> {
        let colon = match src.iter().position(|&b| b == b':') {
            Some(pos) => pos,
            None => {
                if src.len() > 10 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "netstring length prefix too long",
                    ));
                }
                return Ok(None);
            }
        };

        let len: usize = std::str::from_utf8(&src[..colon])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad netstring length")
            })?;

        let total = colon + 1 + len + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        if src[total - 1] != b',' {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "netstring missing trailing comma",
            ));
        }

        src.advance(colon + 1);
        let payload = src.split_to(len);
        src.advance(1);

        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for NetstringCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(item.len().to_string().as_bytes());
        dst.put_u8(b':');
        dst.put_slice(&item);
        dst.put_u8(b',');
        Ok(())
    }
}

/// Snapshot producers the reporting channel pulls from on request or on the
/// periodic push interval. The coordinator supplies fresh text each time;
/// the channel itself holds no domain state.
pub trait SnapshotSource: Send + Sync {
    fn config_snapshot(&self) -> String;
    fn rules_snapshot(&self) -> String;
    fn affiliation_snapshot(&self) -> String;
    fn whitelist_snapshot(&self) -> Vec<u32>;
}

enum Message {
    Tick,
    ClientFrame(SocketAddr, BytesMut),
    ClientDisconnected(SocketAddr),
    Push(ReportFrame),
    RconResult(SocketAddr, String),
}

struct Shared {
    tx: mpsc::UnboundedSender<Message>,
    rcon_tool: Option<String>,
}

struct ClientRegistry {
    tx_shutdown: watch::Sender<bool>,
    tx_bytes: mpsc::UnboundedSender<Bytes>,
}

struct Client {
    addr: SocketAddr,
    frame: Framed<TcpStream, NetstringCodec>,
    rx_shutdown: watch::Receiver<bool>,
    rx_bytes: mpsc::UnboundedReceiver<Bytes>,
}

/// The TCP reporting channel server for one FNE instance.
pub struct ReportingChannel {
    listener: TcpListener,
    shared: Arc<Shared>,
    clients: HashMap<SocketAddr, ClientRegistry>,
    rx: mpsc::UnboundedReceiver<Message>,
    allowed: Vec<IpAddr>,
    push_interval: Duration,
    source: Box<dyn SnapshotSource>,

    /// Handle peers outside `up()` can use to push immediate call events.
    pub tx: mpsc::UnboundedSender<Message>,
}

impl ReportingChannel {
    pub async fn bind(
        addr: (&str, u16),
        allowed: Vec<IpAddr>,
        push_interval: Duration,
        rcon_tool: Option<String>,
        source: Box<dyn SnapshotSource>,
    ) -> FneResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                tx: tx.clone(),
                rcon_tool,
            }),
            clients: HashMap::new(),
            rx,
            allowed,
            push_interval,
            source,
            tx,
        })
    }

    /// Pushes a call event to every connected, allow-listed client
    /// immediately, bypassing the periodic snapshot cadence.
    pub fn push_call_event(&self, event: &CallEvent) {
        let _ = self
            .tx
            .send(Message::Push(ReportFrame::new(ReportOpcode::CallEvent, event.to_line())));
    }

    fn client_allowed(&self, addr: SocketAddr) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&addr.ip())
    }

    pub async fn up(&mut self) -> FneResult<()> {
        self.start_timer();

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    return Ok(());
                }
                Ok((stream, addr)) = self.listener.accept() => {
                    if !self.client_allowed(addr) {
                        continue;
                    }

                    let (tx_shutdown, rx_shutdown) = watch::channel(false);
                    let (tx_bytes, rx_bytes) = mpsc::unbounded_channel();

                    self.clients.insert(addr, ClientRegistry { tx_shutdown, tx_bytes });
                    self.process_client(Client {
                        addr,
                        frame: NetstringCodec.framed(stream),
                        rx_shutdown,
                        rx_bytes,
                    });
                }
                Some(message) = self.rx.recv() => {
                    match message {
                        Message::Tick => self.push_snapshots(),
                        Message::Push(frame) => self.broadcast(frame),
                        Message::ClientFrame(addr, buf) => {
                            if let Err(_e) = self.process_frame(addr, &buf) {
                                if let Some(client) = self.clients.get(&addr) {
                                    let _ = client.tx_shutdown.send(true);
                                }
                            }
                        }
                        Message::ClientDisconnected(addr) => {
                            self.clients.remove(&addr);
                        }
                        Message::RconResult(addr, body) => {
                            self.send_to(addr, ReportFrame::new(ReportOpcode::Rcon, body));
                        }
                    }
                }
            }
        }
    }

    fn process_frame(&mut self, addr: SocketAddr, raw: &[u8]) -> FneResult<()> {
        if raw.is_empty() {
            return Err(FneError::ShortFrame { expected: 1, got: 0 });
        }

        let opcode = ReportOpcode::from_code(raw[0])?;
        let body = String::from_utf8_lossy(&raw[1..]).to_string();

        match opcode {
            ReportOpcode::RequestConfig => {
                let reply = ReportFrame::new(ReportOpcode::ConfigSnapshot, self.source.config_snapshot());
                self.send_to(addr, reply);
            }
            ReportOpcode::Rcon => {
                self.run_rcon(addr, body);
            }
            _ => {}
        }

        Ok(())
    }

    fn run_rcon(&self, addr: SocketAddr, args: String) {
        let tool = match &self.shared.rcon_tool {
            Some(t) => t.clone(),
            None => return,
        };
        let tx = self.shared.tx.clone();

        tokio::spawn(async move {
            let output = Command::new(&tool)
                .args(args.split_whitespace())
                .output()
                .await;

            let body = match output {
                Ok(out) => String::from_utf8_lossy(&out.stdout).to_string(),
                Err(e) => format!("rcon error: {}", e),
            };

            let _ = tx.send(Message::RconResult(addr, body));
        });
    }

    fn push_snapshots(&mut self) {
        let config = self.source.config_snapshot();
        let rules = self.source.rules_snapshot();
        let affiliation = self.source.affiliation_snapshot();
        let whitelist = self.source.whitelist_snapshot();

        self.broadcast(ReportFrame::new(ReportOpcode::ConfigSnapshot, config));
        self.broadcast(ReportFrame::new(ReportOpcode::RulesSnapshot, rules));
        self.broadcast(ReportFrame::new(
            ReportOpcode::AffiliationSnapshot,
            affiliation,
        ));

        let wl_body = whitelist
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.broadcast(ReportFrame::new(ReportOpcode::WhitelistSnapshot, wl_body));
    }

    fn broadcast(&self, frame: ReportFrame) {
        let payload = frame.to_payload();
        for client in self.clients.values() {
            let _ = client.tx_bytes.send(payload.clone());
        }
    }

    fn send_to(&self, addr: SocketAddr, frame: ReportFrame) {
        if let Some(client) = self.clients.get(&addr) {
            let _ = client.tx_bytes.send(frame.to_payload());
        }
    }

    fn process_client(&mut self, client: Client) {
        let shared = self.shared.clone();
        let mut client = client;

        tokio::spawn(async move {
            loop {
                select! {
                    _ = client.rx_shutdown.changed() => {
                        break;
                    }
                    Some(bytes) = client.rx_bytes.recv() => {
                        if client.frame.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    frame = client.frame.next() => {
                        match frame {
                            Some(Ok(buf)) => {
                                let _ = shared.tx.send(Message::ClientFrame(client.addr, buf));
                            }
                            _ => break,
                        }
                    }
                }
            }

            let _ = shared.tx.send(Message::ClientDisconnected(client.addr));
        });
    }

    fn start_timer(&mut self) {
        let tx = self.shared.tx.clone();
        let interval = self.push_interval;

        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if tx.send(Message::Tick).is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netstring_roundtrip() {
        let mut codec = NetstringCodec;
        let mut buf = BytesMut::new();

        codec
            .encode(Bytes::from_static(b"\x00hello"), &mut buf)
            .unwrap();

        assert_eq!(&buf[..], b"6:\x00hello,");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"\x00hello");
    }

    #[test]
    fn netstring_waits_for_more_bytes() {
        let mut codec = NetstringCodec;
        let mut buf = BytesMut::from(&b"10:abc"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn opcode_roundtrip() {
        for code in [0x00u8, 0x01, 0x03, 0x07, 0x08, 0x09, 0x10] {
            let op = ReportOpcode::from_code(code).unwrap();
            assert_eq!(op.code(), code);
        }
    }

    #[test]
    fn call_event_line_format() {
        let event = CallEvent {
            event_type: "GROUP VOICE",
            subtype: "END",
            proto: "DMR",
            system: "NET1".to_string(),
            stream_id: 1,
            peer_id: 100,
            rf_src: 3001,
            slot: 1,
            dst_id: 9,
            duration: Some(std::time::Duration::from_millis(1500)),
        };

        assert_eq!(
            event.to_line(),
            "GROUP VOICE,END,DMR,NET1,1,100,3001,1,9,1.500"
        );
    }
}
