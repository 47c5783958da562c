//! Tests for command/response exchanges and menu navigation.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use regex::Regex;
use rstest::*;

use protocolrs::{
    ByteSink, CommandOptions, CommandSession, Direction, InstrumentError, LoopbackInterface,
    MenuTree, ProtocolState, SessionConfig, Step,
};

type Session = Arc<CommandSession<ProtocolState>>;

/// A sink that records every write and never answers.
#[derive(Clone, Default)]
struct RecordingSink {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ByteSink for RecordingSink {
    fn write_raw(&mut self, data: &[u8]) -> Result<(), InstrumentError> {
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }
}

/// Session settings that keep the tests fast: no wakeup and short timeouts.
#[fixture]
fn config() -> SessionConfig {
    SessionConfig {
        wake_sequence: String::new(),
        wakeup_timeout: Duration::from_millis(100),
        wakeup_delay: Duration::from_millis(1),
        response_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(1),
        ..SessionConfig::default()
    }
}

/// Create a session that talks to `lbk` and reports `state` as the protocol state.
fn crt_session(
    lbk: LoopbackInterface,
    prompts: &[&str],
    config: SessionConfig,
    state: Arc<Mutex<Option<ProtocolState>>>,
) -> Session {
    let receiver = lbk.receiver();
    let session: Session = Arc::new(CommandSession::new(
        Box::new(lbk),
        config,
        prompts.iter().map(|p| p.to_string()).collect(),
        Arc::new(move || *state.lock().unwrap()),
    ));
    let weak = Arc::downgrade(&session);
    receiver.connect(move |bytes| {
        if let Some(session) = weak.upgrade() {
            session.got_data(bytes);
        }
    });
    session
}

fn crt_simple(from_host: Vec<&str>, from_inst: Vec<&str>, config: SessionConfig) -> Session {
    let lbk = LoopbackInterface::new(from_host, from_inst);
    crt_session(lbk, &["S>"], config, Arc::new(Mutex::new(None)))
}

#[rstest]
fn command_response(config: SessionConfig) {
    let session = crt_simple(vec!["ds\r\n"], vec!["\r\nSBE 16plus\r\nvbatt = 9.1\r\nS>"], config);
    session.add_simple_command("ds");

    let response = session.send_command("ds", &[], &CommandOptions::new()).unwrap();
    assert_eq!(response, "SBE 16plus\r\nvbatt = 9.1\r\nS>");
}

#[rstest]
fn command_with_arguments(config: SessionConfig) {
    let session = crt_simple(vec!["interval=10\r\n"], vec!["S>"], config);
    session.add_build_handler("interval", |cmd, args| Ok(format!("{cmd}={}\r\n", args[0])));
    session
        .send_command("interval", &["10".to_string()], &CommandOptions::new())
        .unwrap();
}

#[rstest]
fn wakeup_before_command(mut config: SessionConfig) {
    config.wake_sequence = "\r\n".to_string();
    let session = crt_simple(vec!["\r\n", "qs\r\n"], vec!["S>", "\r\nS>"], config);
    session.add_simple_command("qs");
    let response = session.send_command("qs", &[], &CommandOptions::new()).unwrap();
    assert_eq!(response, "S>");
}

#[rstest]
fn wakeup_timeout(config: SessionConfig) {
    let sink = RecordingSink::default();
    let session: CommandSession<ProtocolState> = CommandSession::new(
        Box::new(sink.clone()),
        config,
        vec!["S>".to_string()],
        Arc::new(|| None::<ProtocolState>),
    );

    let timeout = Duration::from_millis(20);
    match session.wakeup(timeout) {
        Err(InstrumentError::Timeout { timeout: t, .. }) => assert_eq!(t, timeout),
        other => panic!("Expected a timeout, got {other:?}"),
    }
    assert!(!sink.writes.lock().unwrap().is_empty());
}

#[rstest]
fn wakeup_needs_prompts(config: SessionConfig) {
    let session: CommandSession<ProtocolState> = CommandSession::new(
        Box::new(RecordingSink::default()),
        config,
        vec![],
        Arc::new(|| None::<ProtocolState>),
    );
    assert!(matches!(
        session.wakeup(Duration::from_millis(10)),
        Err(InstrumentError::Config(_))
    ));
}

#[rstest]
fn response_timeout(config: SessionConfig) {
    let session = crt_simple(vec!["ts\r\n"], vec![""], config);
    session.add_simple_command("ts");

    let tic = Instant::now();
    let options = CommandOptions::new().timeout(Duration::from_millis(30));
    match session.send_command("ts", &[], &options) {
        Err(InstrumentError::Timeout { operation, timeout }) => {
            assert!(operation.contains("ts"));
            assert_eq!(timeout, Duration::from_millis(30));
        }
        other => panic!("Expected a timeout, got {other:?}"),
    }
    assert!(tic.elapsed() >= Duration::from_millis(30));
}

/// Asking for a prompt and a pattern at once fails before anything is sent. The empty loopback
/// panics on any write.
#[rstest]
fn prompt_and_regex_conflict(config: SessionConfig) {
    let session = crt_simple(vec![], vec![], config);
    session.add_simple_command("ds");
    let options = CommandOptions::new()
        .expected_prompt("S>")
        .response_regex(Regex::new("OK").unwrap());
    assert!(matches!(
        session.send_command("ds", &[], &options),
        Err(InstrumentError::Protocol(_))
    ));
}

#[rstest]
fn unknown_command(config: SessionConfig) {
    let session = crt_simple(vec![], vec![], config);
    match session.send_command("ds", &[], &CommandOptions::new()) {
        Err(InstrumentError::Protocol(msg)) => assert!(msg.contains("ds")),
        other => panic!("Expected a protocol error, got {other:?}"),
    }
}

#[rstest]
fn regex_response(config: SessionConfig) {
    let session = crt_simple(vec!["tc\r\n"], vec!["junk\r\nT=12.5 degC\r\nmore"], config);
    session.add_simple_command("tc");
    let options = CommandOptions::new().response_regex(Regex::new(r"T=(\d+\.\d+)").unwrap());
    assert_eq!(session.send_command("tc", &[], &options).unwrap(), "12.5");
}

#[rstest]
fn expected_prompt_overrides_session_prompts(config: SessionConfig) {
    let session = crt_simple(vec!["M"], vec!["\r\n-- Main Menu --\r\nSelect>"], config);
    session.add_keypress_command("M");
    let options = CommandOptions::new().expected_prompt("Select>");
    assert_eq!(
        session.send_command("M", &[], &options).unwrap(),
        "-- Main Menu --\r\nSelect>"
    );
}

/// `S>` is found even if `>` is a prompt as well.
#[rstest]
fn longest_prompt_wins(config: SessionConfig) {
    let lbk = LoopbackInterface::new(vec!["qs\r\n"], vec!["\r\nS>"]);
    let session = crt_session(lbk, &[">", "S>"], config, Arc::new(Mutex::new(None)));
    session.add_simple_command("qs");
    session.add_response_handler("qs", None, |_, prompt| Ok(prompt.to_string()));
    assert_eq!(
        session.send_command("qs", &[], &CommandOptions::new()).unwrap(),
        "S>"
    );
}

#[rstest]
#[case(Some(ProtocolState::Command), "command handler")]
#[case(Some(ProtocolState::Autosample), "any state handler")]
#[case(None, "any state handler")]
fn state_specific_response_handler(
    config: SessionConfig,
    #[case] state: Option<ProtocolState>,
    #[case] expected: &str,
) {
    let lbk = LoopbackInterface::new(vec!["ds\r\n"], vec!["S>"]);
    let session = crt_session(lbk, &["S>"], config, Arc::new(Mutex::new(state)));
    session.add_simple_command("ds");
    session.add_response_handler("ds", None, |_, _| Ok("any state handler".to_string()));
    session.add_response_handler("ds", Some(ProtocolState::Command), |_, _| {
        Ok("command handler".to_string())
    });
    assert_eq!(
        session.send_command("ds", &[], &CommandOptions::new()).unwrap(),
        expected
    );
}

#[rstest]
fn response_handler_error_propagates(config: SessionConfig) {
    let session = crt_simple(vec!["ds\r\n"], vec!["?CMD\r\nS>"], config);
    session.add_simple_command("ds");
    session.add_response_handler("ds", None, |response, _| {
        Err(InstrumentError::ResponseParseError(response.to_string()))
    });
    assert!(matches!(
        session.send_command("ds", &[], &CommandOptions::new()),
        Err(InstrumentError::ResponseParseError(_))
    ));
}

/// With a write delay, the command goes out one byte at a time.
#[rstest]
fn write_delay_sends_bytes(config: SessionConfig) {
    let sink = RecordingSink::default();
    let session: CommandSession<ProtocolState> = CommandSession::new(
        Box::new(sink.clone()),
        config,
        vec!["S>".to_string()],
        Arc::new(|| None::<ProtocolState>),
    );
    session.add_simple_command("start");

    let options = CommandOptions::new().write_delay(Duration::from_millis(1));
    session
        .send_command_no_response("start", &[], &options)
        .unwrap();

    let writes = sink.writes.lock().unwrap();
    assert_eq!(writes.len(), "start\r\n".len());
    assert!(writes.iter().all(|w| w.len() == 1));
    assert_eq!(writes.concat(), b"start\r\n");
}

#[rstest]
fn send_direct(config: SessionConfig) {
    let session = crt_simple(vec!["\x1b"], vec![""], config);
    session.send_direct(b"\x1b").unwrap();
}

#[rstest]
fn buffers_collect_received_bytes(config: SessionConfig) {
    let session = crt_simple(vec![], vec![], config);
    session.got_data(b"S>");
    session.got_data(b" 1.2");
    assert_eq!(session.line_buffer(), "S> 1.2");
    session.clean_buffers();
    assert_eq!(session.line_buffer(), "");
}

/// A character split over two reads is decoded once it is complete.
#[rstest]
fn character_split_over_reads(config: SessionConfig) {
    let session = crt_simple(vec![], vec![], config);
    let bytes = "T=21.5°C\r\nS>".as_bytes();
    let split = bytes.iter().position(|b| *b >= 0x80).unwrap() + 1;
    session.got_data(&bytes[..split]);
    session.got_data(&bytes[split..]);
    assert_eq!(session.line_buffer(), "T=21.5°C\r\nS>");
}

#[rstest]
fn buffers_keep_newest_bytes(mut config: SessionConfig) {
    config.max_buffer_size = 64;
    let session = crt_simple(vec![], vec![], config);
    for _ in 0..1000 {
        session.got_data(b"#12345\r\n");
    }
    assert_eq!(session.line_buffer(), "#12345\r\n".repeat(8));
}

/// A prompt is still found after the instrument streamed more than the buffers keep.
#[rstest]
fn prompt_found_after_long_output(mut config: SessionConfig) {
    config.max_buffer_size = 256;
    let mut output = "value\r\n".repeat(1000);
    output.push_str("S>");
    let session = crt_simple(vec!["dd\r\n"], vec![output.as_str()], config);
    session.add_simple_command("dd");
    let response = session.send_command("dd", &[], &CommandOptions::new()).unwrap();
    assert!(response.ends_with("value\r\nS>"));
    assert!(response.len() <= 256);
}

/// A menu tree main -> {clock, sample -> interval}.
#[fixture]
fn menu() -> MenuTree {
    let step = |cmd: &str, resp: &str| Direction::Step(Step::new(cmd, resp));
    let menu = |name: &str| Direction::Menu(name.to_string());
    MenuTree::new(HashMap::from([
        ("main".to_string(), vec![step("\r", "Main Menu>")]),
        ("clock".to_string(), vec![menu("main"), step("1", "Clock>")]),
        ("sample".to_string(), vec![menu("main"), step("2", "Sample>")]),
        (
            "interval".to_string(),
            vec![menu("sample"), step("3", "Interval>")],
        ),
    ]))
    .unwrap()
}

#[rstest]
fn navigate_menu(config: SessionConfig, menu: MenuTree) {
    let session = crt_simple(
        vec!["\r", "2", "3"],
        vec!["\r\nMain Menu>", "\r\nSample>", "\r\nInterval>"],
        config,
    );
    for key in ["\r", "1", "2", "3"] {
        session.add_keypress_command(key);
    }
    assert_eq!(
        session.navigate(&menu, "interval").unwrap().as_deref(),
        Some("Interval>")
    );
}

#[rstest]
fn navigate_unknown_menu(config: SessionConfig, menu: MenuTree) {
    let session = crt_simple(vec![], vec![], config);
    assert!(matches!(
        session.navigate(&menu, "calibration"),
        Err(InstrumentError::Protocol(_))
    ));
}

#[rstest]
fn navigate_step_timeout(config: SessionConfig) {
    let menu = MenuTree::new(HashMap::from([(
        "main".to_string(),
        vec![Direction::Step(
            Step::new("\r", "Main Menu>").with_timeout(Duration::from_millis(20)),
        )],
    )]))
    .unwrap();
    let session = crt_simple(vec!["\r"], vec!["Wrong Menu>"], config);
    session.add_keypress_command("\r");
    assert!(matches!(
        session.navigate(&menu, "main"),
        Err(InstrumentError::Timeout { .. })
    ));
}
