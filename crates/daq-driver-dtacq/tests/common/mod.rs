//! In-process stand-in for a digitizer.
//!
//! `MockDigitizer` listens on two ephemeral localhost ports and speaks just
//! enough of the device protocol for the driver:
//! - control: `\n`-terminated commands, answered with text plus a `>` prompt
//! - data: a scripted byte payload, after which the connection is either
//!   closed or held open until the client goes away

#![allow(dead_code)] // Not every test file uses every helper

use daq_driver_dtacq::DeviceConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;

const PROMPT: &str = "acq1001_999 >";

/// What the mock reports and streams.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Channel count per site; discovery ends after the last one
    pub sites: Vec<usize>,
    /// Answer to `data32`
    pub data32: bool,
    /// Extra command/response pairs
    pub responses: HashMap<String, String>,
    /// Bytes sent on every data connection
    pub payload: Vec<u8>,
    /// Close the data connection after the payload
    pub close_after_payload: bool,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            sites: vec![4, 8],
            data32: false,
            responses: HashMap::new(),
            payload: Vec::new(),
            close_after_payload: false,
        }
    }
}

impl MockScript {
    pub fn sites(mut self, sites: &[usize]) -> Self {
        self.sites = sites.to_vec();
        self
    }

    pub fn data32(mut self, data32: bool) -> Self {
        self.data32 = data32;
        self
    }

    pub fn respond(mut self, command: &str, response: &str) -> Self {
        self.responses
            .insert(command.to_string(), response.to_string());
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn close_after_payload(mut self) -> Self {
        self.close_after_payload = true;
        self
    }

    fn answer(&self, command: &str) -> String {
        if command == "prompt on" {
            return String::new();
        }
        if command == "data32" {
            return if self.data32 { "1" } else { "0" }.to_string();
        }
        if let Some(response) = self.responses.get(command) {
            return response.clone();
        }
        let site = command
            .strip_prefix("get.site ")
            .and_then(|rest| rest.strip_suffix(" NCHAN"))
            .and_then(|n| n.parse::<usize>().ok());
        match site {
            Some(site) if site >= 1 && site <= self.sites.len() => self.sites[site - 1].to_string(),
            Some(_) => "ERROR: site not populated".to_string(),
            None => format!("ERROR: unknown command '{}'", command),
        }
    }
}

/// Counters observed by the mock.
#[derive(Debug, Default)]
pub struct MockEvents {
    pub commands: Mutex<Vec<String>>,
    pub control_connections: AtomicUsize,
    pub data_connections: AtomicUsize,
    pub data_disconnects: AtomicUsize,
}

pub struct MockDigitizer {
    runtime: Runtime,
    control_port: u16,
    data_port: u16,
    events: Arc<MockEvents>,
}

impl MockDigitizer {
    pub fn start(script: MockScript) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let events = Arc::new(MockEvents::default());
        let script = Arc::new(script);

        let (control, data) = runtime.block_on(async {
            (
                TcpListener::bind("127.0.0.1:0").await.unwrap(),
                TcpListener::bind("127.0.0.1:0").await.unwrap(),
            )
        });
        let control_port = control.local_addr().unwrap().port();
        let data_port = data.local_addr().unwrap().port();

        runtime.spawn(serve_control(control, Arc::clone(&script), Arc::clone(&events)));
        runtime.spawn(serve_data(data, script, Arc::clone(&events)));

        Self {
            runtime,
            control_port,
            data_port,
            events,
        }
    }

    /// Device settings pointing at this mock.
    pub fn config(&self) -> DeviceConfig {
        DeviceConfig {
            control_port: self.control_port,
            data_port: self.data_port,
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    pub fn address(&self) -> &'static str {
        "127.0.0.1"
    }

    pub fn events(&self) -> &MockEvents {
        &self.events
    }

    pub fn commands(&self) -> Vec<String> {
        self.events.commands.lock().clone()
    }
}

async fn serve_control(listener: TcpListener, script: Arc<MockScript>, events: Arc<MockEvents>) {
    while let Ok((socket, _)) = listener.accept().await {
        events.control_connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(control_session(socket, Arc::clone(&script), Arc::clone(&events)));
    }
}

async fn control_session(socket: TcpStream, script: Arc<MockScript>, events: Arc<MockEvents>) {
    let mut socket = BufReader::new(socket);
    let mut line = String::new();
    loop {
        line.clear();
        match socket.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end().to_string();
        events.commands.lock().push(command.clone());

        let answer = script.answer(&command);
        let reply = if answer.is_empty() {
            PROMPT.to_string()
        } else {
            format!("{}\n{}", answer, PROMPT)
        };
        if socket.get_mut().write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn serve_data(listener: TcpListener, script: Arc<MockScript>, events: Arc<MockEvents>) {
    while let Ok((socket, _)) = listener.accept().await {
        events.data_connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(data_session(socket, Arc::clone(&script), Arc::clone(&events)));
    }
}

async fn data_session(mut socket: TcpStream, script: Arc<MockScript>, events: Arc<MockEvents>) {
    // Uneven slices so words straddle reads
    for piece in script.payload.chunks(1021) {
        if socket.write_all(piece).await.is_err() {
            events.data_disconnects.fetch_add(1, Ordering::SeqCst);
            return;
        }
    }
    let _ = socket.flush().await;

    if !script.close_after_payload {
        let mut sink = [0u8; 64];
        while let Ok(n) = socket.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    }
    events.data_disconnects.fetch_add(1, Ordering::SeqCst);
}

/// Native-endian bytes for 16-bit samples.
pub fn i16_payload(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
}

/// Native-endian bytes for 32-bit samples.
pub fn i32_payload(samples: &[i32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}
