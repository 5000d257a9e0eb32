//! In-process fake streamdev backend for the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

pub const TS_PACKET_SIZE: usize = 188;
pub const RECORDING_SIZE: usize = 20_000;
pub const EMPTY_RECORDING: u32 = 99;

/// Byte at `offset` of the fake recording.
pub fn recording_byte(offset: usize) -> u8 {
    (offset % 251) as u8
}

#[derive(Default)]
struct ReplayState {
    position: usize,
    sent: u64,
}

#[derive(Default)]
struct State {
    commands: Mutex<Vec<String>>,
    denied: Mutex<HashSet<u32>>,
    tuned: AtomicU64,
    live_generation: AtomicU64,
    live_silent: AtomicBool,
    replay_generation: AtomicU64,
    replay: tokio::sync::Mutex<ReplayState>,
    notifications: tokio::sync::Mutex<Option<TcpStream>>,
}

/// Scripted VTP server listening on an ephemeral localhost port.
pub struct FakeBackend {
    pub port: u16,
    state: Arc<State>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self { port, state }
    }

    /// Every command line received so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().clone()
    }

    /// How many received commands start with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .commands
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Makes `PROV` refuse `channel`.
    pub fn deny(&self, channel: u32) {
        self.state.denied.lock().insert(channel);
    }

    /// Stops sending live data without closing the socket.
    pub fn set_live_silent(&self, silent: bool) {
        self.state.live_silent.store(silent, Ordering::SeqCst);
    }

    /// Closes the current live data socket from the backend side.
    pub fn drop_live(&self) {
        self.state.live_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Pushes one line on the notification socket.
    pub async fn notify(&self, line: &str) {
        let mut guard = self.state.notifications.lock().await;
        let stream = guard.as_mut().expect("no notification socket");
        stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Whether a notification socket is connected.
    pub async fn has_notification_socket(&self) -> bool {
        self.state.notifications.lock().await.is_some()
    }
}

/// Live TS packet for `channel` with continuity counter `cc`.
pub fn live_packet(channel: u32, cc: u8) -> Vec<u8> {
    let pid = 0x100 + channel as u16;
    let mut packet = vec![0xaa; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = (pid >> 8) as u8 & 0x1f;
    packet[2] = pid as u8;
    packet[3] = 0x10 | (cc & 0x0f);
    packet
}

/// PID of a TS packet.
pub fn pid_of(packet: &[u8]) -> u16 {
    u16::from(packet[1] & 0x1f) << 8 | u16::from(packet[2])
}

async fn reply(write: &mut OwnedWriteHalf, text: &str) -> bool {
    write
        .write_all(format!("{}\r\n", text).as_bytes())
        .await
        .is_ok()
}

fn parse_port(args: &str) -> Option<(u8, SocketAddr)> {
    let (id, addr) = args.split_once(' ')?;
    let nums: Vec<u16> = addr
        .split(',')
        .map(|n| n.parse().ok())
        .collect::<Option<Vec<_>>>()?;
    if nums.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(nums[0] as u8, nums[1] as u8, nums[2] as u8, nums[3] as u8);
    Some((id.parse().ok()?, SocketAddr::from((ip, nums[4] << 8 | nums[5]))))
}

async fn serve(stream: TcpStream, state: Arc<State>) {
    let (read, mut write) = stream.into_split();
    if !reply(&mut write, "220 fakevdr VTP Server; UTF-8").await {
        return;
    }

    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        state.commands.lock().push(line.clone());
        let (command, args) = line.split_once(' ').unwrap_or((line.as_str(), ""));

        let answer = match command {
            "CAPS" => "220 Capability \"TS\" accepted".to_string(),
            "STAT" => match args {
                "charset" => "220 UTF-8".to_string(),
                "name" => "220 FakeVDR".to_string(),
                "version" => "220 2.6.0".to_string(),
                "disk" => "220 1000MB 250MB 75%".to_string(),
                "channels" => "220 42".to_string(),
                _ => "501 Unknown topic".to_string(),
            },
            "PROV" => {
                let channel: u32 = args
                    .split_whitespace()
                    .nth(1)
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                if state.denied.lock().contains(&channel) {
                    "560 Channel not available".to_string()
                } else {
                    "220 Channel available".to_string()
                }
            }
            "TUNE" => {
                let channel: u64 = args.trim().parse().unwrap_or(0);
                state.tuned.store(channel, Ordering::SeqCst);
                "220 Channel tuned".to_string()
            }
            "PORT" => match parse_port(args) {
                Some((id, addr)) => {
                    if !reply(&mut write, "220 Port command ok, data connection opened").await {
                        break;
                    }
                    connect_back(id, addr, state.clone()).await;
                    continue;
                }
                None => "500 Bad PORT".to_string(),
            },
            "ABRT" => {
                match args.trim() {
                    "0" => {
                        state.live_generation.fetch_add(1, Ordering::SeqCst);
                    }
                    "1" => {
                        state.replay_generation.fetch_add(1, Ordering::SeqCst);
                    }
                    "3" => {
                        state.notifications.lock().await.take();
                    }
                    _ => {}
                }
                "220 Data connection closed".to_string()
            }
            "PLAY" => {
                let index: u32 = args.trim().parse().unwrap_or(0);
                if index == EMPTY_RECORDING {
                    "220 0".to_string()
                } else {
                    *state.replay.lock().await = ReplayState::default();
                    format!("220 {} {}", RECORDING_SIZE, RECORDING_SIZE / 100)
                }
            }
            "SEEK" => match args.trim().parse::<usize>() {
                Ok(offset) if offset <= RECORDING_SIZE => {
                    let mut replay = state.replay.lock().await;
                    let sent = replay.sent;
                    replay.position = offset;
                    format!("220 {}", sent)
                }
                _ => "501 Bad offset".to_string(),
            },
            "SIZE" => format!("220 {}", RECORDING_SIZE),
            "LSTT" => "550 No timers defined".to_string(),
            "LSTC" => "250-1 Das Erste\r\n250 2 ZDF".to_string(),
            "QUIT" => {
                let _ = reply(&mut write, "221 Bye").await;
                break;
            }
            _ => "500 Unknown command".to_string(),
        };

        if !reply(&mut write, &answer).await {
            break;
        }
    }
}

async fn connect_back(id: u8, addr: SocketAddr, state: Arc<State>) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(_) => return,
    };

    match id {
        0 => {
            let generation = state.live_generation.load(Ordering::SeqCst);
            tokio::spawn(stream_live(stream, state, generation));
        }
        1 => {
            let generation = state.replay_generation.load(Ordering::SeqCst);
            tokio::spawn(stream_replay(stream, state, generation));
        }
        3 => {
            *state.notifications.lock().await = Some(stream);
        }
        _ => {}
    }
}

async fn stream_live(mut stream: TcpStream, state: Arc<State>, generation: u64) {
    let channel = state.tuned.load(Ordering::SeqCst) as u32;
    let mut cc = 0u8;
    while state.live_generation.load(Ordering::SeqCst) == generation {
        if !state.live_silent.load(Ordering::SeqCst) {
            if stream.write_all(&live_packet(channel, cc)).await.is_err() {
                break;
            }
            cc = cc.wrapping_add(1);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

async fn stream_replay(mut stream: TcpStream, state: Arc<State>, generation: u64) {
    let data: Vec<u8> = (0..RECORDING_SIZE).map(recording_byte).collect();
    while state.replay_generation.load(Ordering::SeqCst) == generation {
        let mut replay = state.replay.lock().await;
        if replay.position < data.len() {
            let end = (replay.position + 1024).min(data.len());
            if stream.write_all(&data[replay.position..end]).await.is_err() {
                break;
            }
            replay.sent += (end - replay.position) as u64;
            replay.position = end;
        } else {
            drop(replay);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}
