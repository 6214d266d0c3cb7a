//! Device facade against an in-process mock digitizer.
//!
//! | Test | Description |
//! |------|-------------|
//! | `test_discovery_over_tcp` | prompt handshake, site probing and `data32` |
//! | `test_fixed_width_firmware` | `data32` skipped when disabled |
//! | `test_stream_end_delivers_every_sample` | all samples then one sentinel when the device closes |
//! | `test_default_counter_and_stats` | counting handler, stats, stop |
//! | `test_commands_during_readout` | control channel usable while streaming |
//! | `test_handler_error_ends_session` | handler fault closes the data socket |
//! | `test_restart_replaces_session` | second begin stops the first |
//! | `test_try_clone_and_reset` | independent second connection, reconnect |
//! | `test_connection_failures` | control and data connect errors |
//! | `test_drop_stops_readout` | dropping the device closes the stream |

mod common;

use common::{i16_payload, i32_payload, wait_until, MockDigitizer, MockScript};
use daq_driver_dtacq::{AcqError, Chunk, Device, DeviceConfig, Reactor, ReadoutState, SampleWidth};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Helpers
// =============================================================================

fn connect(mock: &MockDigitizer) -> Device {
    Device::with_config(mock.address(), mock.config(), Reactor::new(2).unwrap()).unwrap()
}

fn collecting() -> (
    Arc<Mutex<Vec<Chunk>>>,
    impl FnMut(Chunk) -> anyhow::Result<()> + Send + 'static,
) {
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&chunks);
    let handler = move |chunk: Chunk| -> anyhow::Result<()> {
        sink.lock().push(chunk);
        Ok(())
    };
    (chunks, handler)
}

// =============================================================================
// Discovery
// =============================================================================

#[test]
fn test_discovery_over_tcp() {
    let mock = MockDigitizer::start(MockScript::default().sites(&[4, 8, 16]).data32(true));
    let device = connect(&mock);

    assert_eq!(device.ip_address(), "127.0.0.1");
    assert_eq!(device.num_sites(), 3);
    assert_eq!(device.num_channels(0), 4);
    assert_eq!(device.num_channels(2), 16);
    assert_eq!(device.inventory().total_channels(), 28);
    assert_eq!(device.readout_size(), 4);
    assert_eq!(device.sample_width(), SampleWidth::Word32);

    assert_eq!(
        mock.commands(),
        vec![
            "prompt on",
            "get.site 1 NCHAN",
            "get.site 2 NCHAN",
            "get.site 3 NCHAN",
            "get.site 4 NCHAN",
            "data32",
        ]
    );
}

#[test]
fn test_fixed_width_firmware() {
    let mock = MockDigitizer::start(MockScript::default().data32(true));
    let config = DeviceConfig {
        query_data32: false,
        ..mock.config()
    };
    let device = Device::with_config(mock.address(), config, Reactor::new(1).unwrap()).unwrap();

    assert_eq!(device.readout_size(), 2);
    assert!(!mock.commands().iter().any(|c| c == "data32"));
}

// =============================================================================
// Streaming
// =============================================================================

#[test]
fn test_stream_end_delivers_every_sample() {
    let samples: Vec<i16> = (0..5000).map(|i| (i % 3000) as i16 - 1500).collect();
    let mock = MockDigitizer::start(
        MockScript::default()
            .payload(i16_payload(&samples))
            .close_after_payload(),
    );
    let device = connect(&mock);
    let (chunks, handler) = collecting();

    // Small buffer so the payload arrives in many chunks
    device.begin_readout(handler, 256).unwrap();
    wait_until(|| !device.is_running());
    device.stop_readout();

    let chunks = chunks.lock();
    let (sentinel, data) = chunks.split_last().unwrap();
    assert!(sentinel.is_empty());
    assert!(data.iter().all(|c| c.width() == SampleWidth::Word16));

    let received: Vec<i16> = data
        .iter()
        .flat_map(|c| c.as_i16().unwrap().to_vec())
        .collect();
    assert_eq!(received, samples);

    let stats = device.readout_stats();
    assert_eq!(stats.bytes_read, 10_000);
    assert_eq!(stats.samples_delivered, 5000);
    assert_eq!(device.readout_state(), ReadoutState::Idle);
}

#[test]
fn test_default_counter_and_stats() {
    let samples: Vec<i32> = (0..4096).collect();
    let mock = MockDigitizer::start(MockScript::default().data32(true).payload(i32_payload(&samples)));
    let device = connect(&mock);

    device.begin_readout_default(device.config().buffer_size).unwrap();
    assert_eq!(device.readout_state(), ReadoutState::Running);
    wait_until(|| device.samples_received() == 4096);
    assert!(device.is_running());

    device.stop_readout();
    assert!(!device.is_running());
    assert_eq!(device.readout_state(), ReadoutState::Idle);

    let stats = device.readout_stats();
    assert_eq!(stats.bytes_read, 4096 * 4);
    assert!(stats.elapsed > Duration::ZERO);
    assert_eq!(stats.callback_faults, 0);

    // Stopping again is a no-op
    device.stop_readout();
}

#[test]
fn test_commands_during_readout() {
    let mock = MockDigitizer::start(
        MockScript::default()
            .respond("set.site 1 trg=1,0,1", "")
            .payload(i16_payload(&[1; 64])),
    );
    let device = connect(&mock);

    device.begin_readout_default(1024).unwrap();
    assert_eq!(device.send_command("get.site 2 NCHAN").unwrap(), "8");
    assert_eq!(device.send_command("set.site 1 trg=1,0,1").unwrap(), "");
    assert!(device.is_running());
    device.stop_readout();

    assert!(device
        .send_command("bogus")
        .unwrap()
        .starts_with("ERROR: unknown command"));
}

#[test]
fn test_handler_error_ends_session() {
    let mock = MockDigitizer::start(MockScript::default().payload(i16_payload(&[7; 2048])));
    let device = connect(&mock);

    let handler = |chunk: Chunk| -> anyhow::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        anyhow::bail!("cannot process {} samples", chunk.len())
    };
    device.begin_readout(handler, 512).unwrap();

    // The mock holds its side open; only the fault can close the socket
    wait_until(|| !device.is_running());
    device.stop_readout();
    assert!(device.readout_stats().callback_faults >= 1);
    wait_until(|| mock.events().data_disconnects.load(Ordering::SeqCst) == 1);
}

#[test]
fn test_restart_replaces_session() {
    let mock = MockDigitizer::start(MockScript::default().payload(i16_payload(&[3; 100])));
    let device = connect(&mock);

    let (first, handler) = collecting();
    device.begin_readout(handler, 4096).unwrap();
    wait_until(|| first.lock().iter().map(Chunk::len).sum::<usize>() == 100);

    device.begin_readout_default(4096).unwrap();
    // The first session was fully drained before the second began
    assert!(first.lock().last().is_some_and(Chunk::is_empty));
    wait_until(|| device.samples_received() == 100);

    device.stop_readout();
    assert_eq!(mock.events().data_connections.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Connection management
// =============================================================================

#[test]
fn test_try_clone_and_reset() {
    let mock = MockDigitizer::start(MockScript::default().sites(&[32]));
    let mut device =
        Device::with_config("", mock.config(), Reactor::new(1).unwrap()).unwrap();
    assert_eq!(device.num_sites(), 0);
    assert!(matches!(
        device.send_command("data32"),
        Err(AcqError::NotConnected)
    ));

    device.reset_ip_address(mock.address()).unwrap();
    assert_eq!(device.num_sites(), 1);
    assert_eq!(device.num_channels(0), 32);

    let copy = device.try_clone().unwrap();
    assert_eq!(copy.ip_address(), device.ip_address());
    assert_eq!(copy.inventory(), device.inventory());
    assert_eq!(mock.events().control_connections.load(Ordering::SeqCst), 2);

    // Each copy has its own control socket
    drop(device);
    assert_eq!(copy.send_command("get.site 1 NCHAN").unwrap(), "32");
}

#[test]
fn test_connection_failures() {
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = DeviceConfig {
        control_port: closed_port,
        connect_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let err = Device::with_config("127.0.0.1", config, Reactor::new(1).unwrap()).unwrap_err();
    assert!(matches!(err, AcqError::Connection { .. }));
    assert!(err.requires_reconnect());

    // Control reachable, data port not
    let mock = MockDigitizer::start(MockScript::default());
    let config = DeviceConfig {
        data_port: closed_port,
        ..mock.config()
    };
    let device = Device::with_config(mock.address(), config, Reactor::new(1).unwrap()).unwrap();
    let err = device.begin_readout_default(1024).unwrap_err();
    assert!(matches!(err, AcqError::Connection { .. }));
    assert_eq!(device.readout_state(), ReadoutState::Idle);
    assert!(!device.is_running());
}

#[test]
fn test_drop_stops_readout() {
    let mock = MockDigitizer::start(MockScript::default().payload(i16_payload(&[1; 10])));
    let device = connect(&mock);

    device.begin_readout_default(1024).unwrap();
    wait_until(|| device.samples_received() == 10);
    drop(device);

    wait_until(|| mock.events().data_disconnects.load(Ordering::SeqCst) == 1);
}
