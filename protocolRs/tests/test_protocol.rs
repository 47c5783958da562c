//! Tests for the composed instrument protocol.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use rstest::*;

use protocolrs::{
    Capabilities, CommandOptions, InstrumentError, InstrumentProtocol, LoopbackInterface,
    ProtocolConfig, ProtocolEvent, ProtocolState, RegexSieve, SessionConfig, TriggerConfig,
    Transition, scheduler::IntervalSpec,
};

type Protocol = InstrumentProtocol<ProtocolState, ProtocolEvent, (), String>;

#[fixture]
fn config() -> SessionConfig {
    SessionConfig {
        wake_sequence: String::new(),
        response_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(1),
        ..SessionConfig::default()
    }
}

/// Create a protocol talking to a loopback interface.
fn crt_protocol(
    from_host: Vec<&str>,
    from_inst: Vec<&str>,
    config: SessionConfig,
    capabilities: Capabilities,
) -> Protocol {
    let lbk = LoopbackInterface::new(from_host, from_inst);
    let receiver = lbk.receiver();
    let protocol = Protocol::new(Box::new(lbk), config, capabilities, vec!["S>".to_string()]);
    receiver.connect(protocol.receiver());
    protocol
}

/// A loopback that expects no commands at all.
fn silent() -> Box<LoopbackInterface> {
    Box::new(LoopbackInterface::new(Vec::<&str>::new(), Vec::<&str>::new()))
}

fn with_scheduler() -> Capabilities {
    Capabilities {
        scheduler: true,
        ..Capabilities::default()
    }
}

#[rstest]
fn handler_talks_through_session(config: SessionConfig) {
    let protocol = crt_protocol(
        vec!["ds\r\n"],
        vec!["\r\nvbatt = 9.1\r\nS>"],
        config,
        Capabilities::default(),
    );
    protocol.session().add_simple_command("ds");

    let session = Arc::clone(protocol.session());
    protocol
        .add_handler(ProtocolState::Unknown, ProtocolEvent::Discover, move |_| {
            let status = session.send_command("ds", &[], &CommandOptions::new())?;
            Ok(Transition::next(ProtocolState::Command, Some(status)))
        })
        .unwrap();
    protocol.start(ProtocolState::Unknown).unwrap();

    let status = protocol.on_event(ProtocolEvent::Discover, ()).unwrap();
    assert_eq!(status.as_deref(), Some("vbatt = 9.1\r\nS>"));
    assert_eq!(protocol.get_current_state(), Some(ProtocolState::Command));
    assert_eq!(protocol.get_events(false), vec![ProtocolEvent::Discover]);
}

#[rstest]
fn frames_reach_the_frame_handler(config: SessionConfig) {
    let protocol = Protocol::new(silent(), config, Capabilities::default(), vec![]);
    protocol.set_sieve(RegexSieve::new(&[r"#\d+\r\n"]).unwrap());

    let frames = Arc::new(Mutex::new(Vec::new()));
    let clone = Arc::clone(&frames);
    protocol.set_frame_handler(move |timestamp: f64, frame: &[u8]| {
        clone.lock().unwrap().push((timestamp, frame.to_vec()));
    });

    protocol.got_data(b"xx#12\r\n#3", 1.0);
    protocol.got_data(b"\r\nyy", 2.0);

    assert_eq!(
        *frames.lock().unwrap(),
        vec![(1.0, b"#12\r\n".to_vec()), (1.0, b"#3\r\n".to_vec())]
    );
    // The session sees all bytes.
    assert_eq!(protocol.session().line_buffer(), "xx#12\r\n#3\r\nyy");
}

#[rstest]
fn frames_without_handler_are_dropped(config: SessionConfig) {
    let protocol = Protocol::new(silent(), config, Capabilities::default(), vec![]);
    protocol.set_sieve(RegexSieve::new(&[r"#\d+\r\n"]).unwrap());
    protocol.got_data(b"#1\r\n", 0.0);

    let count = Arc::new(AtomicUsize::new(0));
    let clone = Arc::clone(&count);
    protocol.set_frame_handler(move |_: f64, _: &[u8]| {
        clone.fetch_add(1, Ordering::SeqCst);
    });
    protocol.got_data(b"#2\r\n", 0.0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[rstest]
fn receiver_timestamps_bytes(config: SessionConfig) {
    let protocol = Protocol::new(silent(), config, Capabilities::default(), vec![]);
    protocol.set_sieve(RegexSieve::new(&[r"#\d+\r\n"]).unwrap());
    let timestamps = Arc::new(Mutex::new(Vec::new()));
    let clone = Arc::clone(&timestamps);
    protocol.set_frame_handler(move |timestamp: f64, _: &[u8]| {
        clone.lock().unwrap().push(timestamp);
    });

    let receiver = protocol.receiver();
    let before = chrono::Utc::now().timestamp() as f64;
    thread::spawn(move || receiver(b"#7\r\n")).join().unwrap();

    let timestamps = timestamps.lock().unwrap();
    assert_eq!(timestamps.len(), 1);
    assert!(timestamps[0] >= before);
}

const MENU_CONFIG: &str = r#"
prompts = ["S>"]

[session]
wake_sequence = ""
response_timeout = "100ms"
poll_interval = "1ms"

[capabilities]
menus = true

[menu_root]
command = "\u001b"
response = "Main Menu>"

[menus]
main = [{ command = "\r", response = "Main Menu>" }]
sample = ["main", { command = "2", response = "Sample>" }]
"#;

#[rstest]
fn menus_from_config() {
    let config = ProtocolConfig::from_toml_str(MENU_CONFIG).unwrap();
    let lbk = LoopbackInterface::new(
        vec!["\r", "2", "\u{1b}"],
        vec!["\r\nMain Menu>", "\r\nSample>", "\r\nMain Menu>"],
    );
    let receiver = lbk.receiver();
    let protocol = Protocol::from_config(Box::new(lbk), config).unwrap();
    receiver.connect(protocol.receiver());

    assert!(protocol.capabilities().menus);
    assert_eq!(protocol.navigate("sample").unwrap().as_deref(), Some("Sample>"));
    assert_eq!(protocol.go_to_root().unwrap(), "Main Menu>");
    assert!(matches!(
        protocol.navigate("calibration"),
        Err(InstrumentError::Protocol(_))
    ));
}

#[rstest]
fn no_menus(config: SessionConfig) {
    let protocol = Protocol::new(silent(), config, Capabilities::default(), vec![]);
    assert!(!protocol.capabilities().menus);
    assert!(matches!(
        protocol.navigate("main"),
        Err(InstrumentError::Protocol(_))
    ));
    assert!(matches!(
        protocol.go_to_root(),
        Err(InstrumentError::Protocol(_))
    ));
}

#[rstest]
#[case("[capabilities]\nmenus = true")]
#[case("[menu_root]\ncommand = \"\\r\"\nresponse = \"Main Menu>\"")]
#[case("[menus]\nmain = [{ command = \"\\r\", response = \"Main Menu>\" }]")]
#[case("[jobs.status]\ntype = \"polled\"\nminimum_interval = { seconds = 5 }")]
fn capabilities_must_match_config(#[case] toml: &str) {
    let config = ProtocolConfig::from_toml_str(toml).unwrap();
    assert!(matches!(
        Protocol::from_config(silent(), config),
        Err(InstrumentError::Config(_))
    ));
}

#[rstest]
fn invalid_toml() {
    assert!(matches!(
        ProtocolConfig::from_toml_str("[capabilities]\nmenus = 3"),
        Err(InstrumentError::Toml(_))
    ));
}

/// Register an ACQUIRE_STATUS handler in command mode that counts its calls.
fn count_status(protocol: &Protocol) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let clone = Arc::clone(&count);
    protocol
        .add_handler(
            ProtocolState::Command,
            ProtocolEvent::AcquireStatus,
            move |_| {
                clone.fetch_add(1, Ordering::SeqCst);
                Ok(Transition::stay(None))
            },
        )
        .unwrap();
    protocol.start(ProtocolState::Command).unwrap();
    count
}

fn wait_for(count: &AtomicUsize, target: usize) -> usize {
    let tic = Instant::now();
    while count.load(Ordering::SeqCst) < target && tic.elapsed() < Duration::from_secs(3) {
        thread::sleep(Duration::from_millis(5));
    }
    count.load(Ordering::SeqCst)
}

#[rstest]
fn scheduled_event_is_raised(config: SessionConfig) {
    let protocol = Protocol::new(silent(), config, with_scheduler(), vec![]);
    let count = count_status(&protocol);

    protocol
        .add_scheduled_event(
            "status",
            TriggerConfig::polled(IntervalSpec::from_seconds(5), None),
            ProtocolEvent::AcquireStatus,
        )
        .unwrap();
    assert!(protocol.run_job("status").unwrap());
    assert!(!protocol.run_job("status").unwrap());
    assert_eq!(wait_for(&count, 1), 1);

    protocol.remove_job("status").unwrap();
    assert!(matches!(
        protocol.run_job("status"),
        Err(InstrumentError::JobLookup(_))
    ));
}

#[rstest]
fn configured_event() {
    let config = ProtocolConfig::from_toml_str(
        r#"
        [session]
        wake_sequence = ""

        [capabilities]
        scheduler = true

        [jobs.status]
        type = "polled"
        minimum_interval = { seconds = 5 }
        "#,
    )
    .unwrap();
    let protocol = Protocol::from_config(silent(), config).unwrap();
    let count = count_status(&protocol);

    protocol
        .add_configured_event("status", ProtocolEvent::AcquireStatus)
        .unwrap();
    assert!(matches!(
        protocol.add_configured_event("clock_sync", ProtocolEvent::ClockSync),
        Err(InstrumentError::Config(_))
    ));
    assert!(protocol.run_job("status").unwrap());
    assert_eq!(wait_for(&count, 1), 1);
}

#[rstest]
fn no_scheduler(config: SessionConfig) {
    let protocol = Protocol::new(silent(), config, Capabilities::default(), vec![]);
    assert!(protocol.scheduler().is_err());
    assert!(matches!(
        protocol.run_job("status"),
        Err(InstrumentError::Protocol(_))
    ));
    assert!(matches!(
        protocol.add_scheduled_event(
            "status",
            TriggerConfig::polled(IntervalSpec::from_seconds(5), None),
            ProtocolEvent::AcquireStatus,
        ),
        Err(InstrumentError::Protocol(_))
    ));
}

/// Driver handlers report bad arguments and instrument errors to whoever raised the event.
#[rstest]
fn driver_errors_reach_the_caller(config: SessionConfig) {
    let lbk = LoopbackInterface::new(vec!["interval=0\r\n"], vec!["?CMD interval\r\nS>"]);
    let receiver = lbk.receiver();
    let protocol: InstrumentProtocol<ProtocolState, ProtocolEvent, u32, String> =
        InstrumentProtocol::new(
            Box::new(lbk),
            config,
            Capabilities::default(),
            vec!["S>".to_string()],
        );
    receiver.connect(protocol.receiver());

    let session = Arc::clone(protocol.session());
    session.add_build_handler("interval", |cmd, args| Ok(format!("{cmd}={}\r\n", args[0])));
    session.add_response_handler("interval", None, |response, _| {
        if response.starts_with("?CMD") {
            let message = response.lines().next().unwrap_or_default();
            return Err(InstrumentError::InstrumentStatus(message.to_string()));
        }
        Ok(response.to_string())
    });
    protocol
        .add_handler(
            ProtocolState::Command,
            ProtocolEvent::Set,
            move |interval: u32| {
                if interval > 3600 {
                    return Err(InstrumentError::InvalidArgument(format!(
                        "interval {interval} s is out of range"
                    )));
                }
                let response = session.send_command(
                    "interval",
                    &[interval.to_string()],
                    &CommandOptions::new(),
                )?;
                Ok(Transition::stay(Some(response)))
            },
        )
        .unwrap();
    protocol.start(ProtocolState::Command).unwrap();

    match protocol.on_event(ProtocolEvent::Set, 7200) {
        Err(err @ InstrumentError::InvalidArgument(_)) => {
            assert_eq!(err.to_string(), "interval 7200 s is out of range")
        }
        other => panic!("Expected an invalid argument, got {other:?}"),
    }
    match protocol.on_event(ProtocolEvent::Set, 0) {
        Err(err @ InstrumentError::InstrumentStatus(_)) => {
            assert_eq!(err.to_string(), "?CMD interval")
        }
        other => panic!("Expected an instrument status, got {other:?}"),
    }
}

/// Streaming samples does not grow the session buffers without bound.
#[rstest]
fn streaming_keeps_session_buffers_bounded(mut config: SessionConfig) {
    config.max_buffer_size = 1024;
    let protocol = Protocol::new(silent(), config, Capabilities::default(), vec![]);
    protocol.set_sieve(RegexSieve::new(&[r"#\d+\r\n"]).unwrap());
    let count = Arc::new(AtomicUsize::new(0));
    let clone = Arc::clone(&count);
    protocol.set_frame_handler(move |_: f64, _: &[u8]| {
        clone.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..10_000 {
        protocol.got_data(b"#12345\r\n", 0.0);
    }
    assert_eq!(count.load(Ordering::SeqCst), 10_000);
    let line = protocol.session().line_buffer();
    assert_eq!(line.len(), 1024);
    assert!(line.ends_with("#12345\r\n"));
}
