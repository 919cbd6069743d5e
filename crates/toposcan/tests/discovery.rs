// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end discovery runs against a synthetic host.
//!
//! The rig assembles the full object graph the orchestrator navigates -
//! root services, topology globals, workstation, buses, enumerators with
//! connection points - and scripts the host's asynchronous behavior:
//! starting an enumeration fires found-events through the subscribed
//! channels and flips the topology document the snapshot source serves.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};
use toposcan::apartment::{LoopHandle, MessageLoop};
use toposcan::channel::{ChannelListener, ReportLine};
use toposcan::host::{
    Address, CallError, ConnectionPoint, HostObject, ObjRef, Value, CAP_ONLINE_NOTIFY,
};
use toposcan::{HostRuntime, RunError};

const IDENTIFIED_DOC: &str = r#"<topology>
  <device classname="Workstation" name="THIS-WS">
    <bus name="Test">
      <address type="String" value="10.0.0.5">
        <device classname="LogixController" name="1756-L85E"/>
      </address>
    </bus>
  </device>
</topology>"#;

const UNRECOGNIZED_DOC: &str = r#"<topology>
  <device classname="Workstation" name="THIS-WS">
    <bus name="Test">
      <address type="String" value="10.0.0.5">
        <device classname="Unrecognized Device" name="10.0.0.5"/>
      </address>
    </bus>
  </device>
</topology>"#;

const EMPTY_DOC: &str = r#"<topology>
  <device classname="Workstation" name="THIS-WS"/>
</topology>"#;

/// Each run swaps the process-global logger outputs and configuration, so
/// full runs must not overlap within one test process.
fn serialize() -> parking_lot::MutexGuard<'static, ()> {
    static GATE: OnceLock<Mutex<()>> = OnceLock::new();
    GATE.get_or_init(|| Mutex::new(())).lock()
}

/// Handles into the synthetic host.
struct TestHost {
    root: ObjRef,
    /// Document served by the snapshot source; scripts swap it to emulate
    /// the host identifying devices over time.
    doc: Arc<Mutex<String>>,
    /// How often the bus's device collection was asked for (gate probe).
    device_collection_calls: Arc<AtomicUsize>,
}

/// Build a host with one bus named `Test`.
///
/// `post_start_doc` is what snapshots show once the browse has started;
/// the enumeration emits found(10.0.0.5), found(10.0.0.9), found(10.0.0.5)
/// - the repeat completes the cycle heuristically.
fn build_host(post_start_doc: &'static str) -> TestHost {
    let doc = Arc::new(Mutex::new(EMPTY_DOC.to_string()));
    let device_collection_calls = Arc::new(AtomicUsize::new(0));

    // Enumerator with its notify channel.
    let enum_cp = ConnectionPoint::new(CAP_ONLINE_NOTIFY);
    let enum_cp2 = enum_cp.clone();
    let doc_for_start = doc.clone();
    let enumerator = HostObject::builder("Test-enum")
        .slot(7, move |_| {
            *doc_for_start.lock() = post_start_doc.to_string();
            for addr in ["10.0.0.5", "10.0.0.9", "10.0.0.5"] {
                enum_cp2.emit_found(None, &Address::Text(addr.into()));
            }
            Ok(Value::Empty)
        })
        .slot(8, |_| Ok(Value::Empty))
        .connection_point(enum_cp)
        .build();

    // A device without a backplane port; visible to the bus browse phase
    // if it ever runs.
    let device = HostObject::builder("edge-device")
        .slot(1, |_| Ok(Value::Str("1756-L85E".into())))
        .slot(2, |_| Ok(Value::Str("obj-17".into())))
        .build();
    let device2 = device.clone();
    let devices = HostObject::builder("Test-devices")
        .slot(1, |_| Ok(Value::Int(1)))
        .slot(0, move |_| Ok(Value::Obj(device2.clone())))
        .build();

    let registered: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let enumerator2 = enumerator.clone();
    let devices2 = devices.clone();
    let collection_calls = device_collection_calls.clone();
    let path = HostObject::builder("Test-path").build();
    let bus = HostObject::builder("Test")
        .slot(54, move |args| {
            let addr = args[0].as_str().unwrap_or_default().to_string();
            let mut registered = registered.lock();
            if registered.contains(&addr) {
                return Err(CallError::AlreadyExists);
            }
            registered.push(addr);
            Ok(Value::Empty)
        })
        .slot(21, move |_| Ok(Value::Obj(enumerator2.clone())))
        .slot(4, move |_| Ok(Value::Obj(path.clone())))
        .slot(50, move |_| {
            collection_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Obj(devices2.clone()))
        })
        .build();

    let bus2 = bus.clone();
    let workstation = HostObject::builder("workstation")
        .slot(38, move |args| {
            if args[0].as_str() == Some("Test") {
                Ok(Value::Obj(bus2.clone()))
            } else {
                Err(CallError::Refused)
            }
        })
        .build();

    let workstation2 = workstation.clone();
    let doc_for_dump = doc.clone();
    let globals = HostObject::builder("globals")
        .slot(12, move |_| Ok(Value::Obj(workstation2.clone())))
        .slot(0x6001_0000, move |_| Ok(Value::Str(doc_for_dump.lock().clone())))
        .build();

    let globals2 = globals.clone();
    let root = HostObject::builder("root")
        .slot(9, move |_| Ok(Value::Obj(globals2.clone())))
        .build();

    TestHost {
        root,
        doc,
        device_collection_calls,
    }
}

fn spawn_loop() -> (LoopHandle, thread::JoinHandle<()>) {
    let (lp, handle) = MessageLoop::new();
    let joiner = thread::spawn(move || lp.run());
    while handle.thread_id().is_none() {
        thread::sleep(Duration::from_millis(1));
    }
    (handle, joiner)
}

/// Controller side: accept the hook, push a configuration, collect report
/// lines until `D|` (or the deadline).
fn run_controller(
    listener: ChannelListener,
    config_lines: Vec<String>,
    stop_after: Option<Duration>,
) -> thread::JoinHandle<Vec<ReportLine>> {
    thread::spawn(move || {
        let transport = listener.accept().expect("hook connects");
        for line in config_lines {
            transport.send_line(&line).expect("config sent");
        }

        let mut report = Vec::new();
        let mut in_snapshot = false;
        let started = Instant::now();
        let mut stop_sent = false;
        let deadline = Instant::now() + Duration::from_secs(60);

        loop {
            if let Some(after) = stop_after {
                if !stop_sent && started.elapsed() >= after {
                    let _ = transport.send_line("STOP");
                    stop_sent = true;
                }
            }
            if Instant::now() > deadline {
                panic!("controller never saw D|");
            }
            match transport.read_line(Duration::from_millis(100)) {
                Ok(Some(line)) => {
                    let parsed = toposcan::channel::parse_report_line(&line, in_snapshot);
                    match parsed {
                        ReportLine::SnapshotBegin => in_snapshot = true,
                        ReportLine::SnapshotEnd => in_snapshot = false,
                        ReportLine::Done => {
                            report.push(ReportLine::Done);
                            break;
                        }
                        other => report.push(other),
                    }
                }
                Ok(None) => continue,
                Err(_) => break,
            }
        }
        report
    })
}

fn config_lines(mode: &str, log_dir: &std::path::Path) -> Vec<String> {
    vec![
        format!("C|MODE={}", mode),
        format!("C|LOGDIR={}", log_dir.display()),
        "C|DRIVER=Test".to_string(),
        "C|ADDR=10.0.0.5".to_string(),
        "C|SOME_FUTURE_KEY=ignored".to_string(),
        "C|END".to_string(),
    ]
}

#[test]
fn one_shot_identifies_target() {
    let _gate = serialize();
    let host = build_host(IDENTIFIED_DOC);
    let (loop_handle, loop_join) = spawn_loop();
    let log_dir = tempfile::tempdir().unwrap();

    let listener = ChannelListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let controller = run_controller(listener, config_lines("oneshot", log_dir.path()), None);

    let hook = toposcan::start(
        HostRuntime {
            loop_handle: loop_handle.clone(),
            root: host.root.clone(),
        },
        &addr,
    );

    let summary = hook.join().expect("run succeeds");
    assert_eq!(summary.targets_identified, Some(true));
    assert!(summary.counts.identified_devices >= 1);
    assert_eq!(summary.events, 3);
    assert_eq!(summary.cleanup.enumerators_stopped, 1);
    assert_eq!(summary.cleanup.stop_failures, 0);
    assert!(summary.cleanup.subscriptions_released >= 1);

    let report = controller.join().unwrap();
    assert!(matches!(report.last(), Some(ReportLine::Done)));
    assert!(report
        .iter()
        .any(|line| matches!(line, ReportLine::Status { identified, .. } if *identified >= 1)));
    assert!(report
        .iter()
        .any(|line| matches!(line, ReportLine::Payload(p) if p.contains("LogixController"))));

    // The results file the surrounding tooling watches for.
    let results = std::fs::read_to_string(log_dir.path().join("results.txt")).unwrap();
    assert!(results.contains("TARGET_STATUS: IDENTIFIED"));
    assert!(results.contains("EVENTS: 3"));

    // The log file moved into the configured directory.
    let log = std::fs::read_to_string(log_dir.path().join("toposcan.log")).unwrap();
    assert!(log.contains("browse started"));

    loop_handle.quit();
    loop_join.join().unwrap();
}

#[test]
fn one_shot_unrecognized_skips_deeper_phases() {
    let _gate = serialize();
    let host = build_host(UNRECOGNIZED_DOC);
    let (loop_handle, loop_join) = spawn_loop();
    let log_dir = tempfile::tempdir().unwrap();

    let listener = ChannelListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let controller = run_controller(listener, config_lines("oneshot", log_dir.path()), None);

    let hook = toposcan::start(
        HostRuntime {
            loop_handle: loop_handle.clone(),
            root: host.root.clone(),
        },
        &addr,
    );

    let summary = hook.join().expect("run succeeds");
    assert_eq!(summary.targets_identified, Some(false));
    assert_eq!(summary.counts.identified_devices, 0);

    // Zero identified devices gates the deeper phases: the bus's device
    // collection must never have been touched.
    assert_eq!(host.device_collection_calls.load(Ordering::SeqCst), 0);

    let report = controller.join().unwrap();
    assert!(report
        .iter()
        .any(|line| matches!(line, ReportLine::Log(l) if l.contains("skipped"))));

    let results = std::fs::read_to_string(log_dir.path().join("results.txt")).unwrap();
    assert!(results.contains("TARGET_STATUS: NOT_FOUND"));

    loop_handle.quit();
    loop_join.join().unwrap();
}

#[test]
fn monitor_mode_stops_on_stop_line() {
    let _gate = serialize();
    let host = build_host(IDENTIFIED_DOC);
    let (loop_handle, loop_join) = spawn_loop();
    let log_dir = tempfile::tempdir().unwrap();

    let listener = ChannelListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let controller = run_controller(
        listener,
        config_lines("monitor", log_dir.path()),
        Some(Duration::from_millis(1500)),
    );

    let hook = toposcan::start(
        HostRuntime {
            loop_handle: loop_handle.clone(),
            root: host.root.clone(),
        },
        &addr,
    );

    let started = Instant::now();
    let summary = hook.join().expect("run succeeds");
    // STOP at ~1.5s; the monitor loop honors it within one step, then
    // cleanup and reporting run to completion.
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(summary.cleanup.enumerators_stopped, 1);

    let report = controller.join().unwrap();
    assert!(matches!(report.last(), Some(ReportLine::Done)));

    loop_handle.quit();
    loop_join.join().unwrap();
}

#[test]
fn config_without_targets_is_fatal() {
    let _gate = serialize();
    let host = build_host(IDENTIFIED_DOC);
    let (loop_handle, loop_join) = spawn_loop();

    let listener = ChannelListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let controller = thread::spawn(move || {
        let transport = listener.accept().expect("hook connects");
        transport.send_line("C|MODE=oneshot").unwrap();
        transport.send_line("C|END").unwrap();
        // Drain until the channel closes.
        loop {
            match transport.read_line(Duration::from_millis(100)) {
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    let hook = toposcan::start(
        HostRuntime {
            loop_handle: loop_handle.clone(),
            root: host.root.clone(),
        },
        &addr,
    );

    let result = hook.join();
    assert!(matches!(result, Err(RunError::Config(_))));
    // Nothing was started, so nothing could leak.
    assert_eq!(host.doc.lock().as_str(), EMPTY_DOC);

    controller.join().unwrap();
    loop_handle.quit();
    loop_join.join().unwrap();
}

#[test]
fn controller_disconnect_during_config_is_fatal() {
    let _gate = serialize();
    let host = build_host(IDENTIFIED_DOC);
    let (loop_handle, loop_join) = spawn_loop();

    let listener = ChannelListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let controller = thread::spawn(move || {
        let transport = listener.accept().expect("hook connects");
        transport.send_line("C|DRIVER=Test").unwrap();
        transport.disconnect();
    });

    let hook = toposcan::start(
        HostRuntime {
            loop_handle: loop_handle.clone(),
            root: host.root.clone(),
        },
        &addr,
    );

    let result = hook.join();
    assert!(matches!(result, Err(RunError::Channel(_))));

    controller.join().unwrap();
    loop_handle.quit();
    loop_join.join().unwrap();
}

/// Controller sends config, then a late `STOP` mid-polling: the run must
/// still finish with a complete cleanup.
#[test]
fn stop_during_polling_still_cleans_up() {
    let _gate = serialize();
    let host = build_host(UNRECOGNIZED_DOC);
    let (loop_handle, loop_join) = spawn_loop();
    let log_dir = tempfile::tempdir().unwrap();

    let listener = ChannelListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let controller = run_controller(
        listener,
        config_lines("oneshot", log_dir.path()),
        Some(Duration::from_millis(700)),
    );

    let hook = toposcan::start(
        HostRuntime {
            loop_handle: loop_handle.clone(),
            root: host.root.clone(),
        },
        &addr,
    );

    let summary = hook.join().expect("run succeeds");
    assert_eq!(summary.cleanup.enumerators_stopped, 1);
    assert_eq!(summary.cleanup.stop_failures, 0);

    let report = controller.join().unwrap();
    assert!(matches!(report.last(), Some(ReportLine::Done)));

    loop_handle.quit();
    loop_join.join().unwrap();
}
