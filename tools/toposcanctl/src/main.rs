// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! toposcanctl - controller CLI for a toposcan hook.
//!
//! Hosts the control channel endpoint, pushes the discovery configuration,
//! then renders the hook's log/status stream until it reports completion.
//! Snapshot documents can be saved for inspection.

use std::io::Write;
use std::time::{Duration, Instant};
use toposcan::channel::{ChannelListener, ReportLine};
use toposcan::snapshot;

struct Options {
    listen: String,
    mode: String,
    log_dir: Option<String>,
    drivers: Vec<(String, Vec<String>, bool)>,
    stop_after: Option<Duration>,
    snapshot_file: Option<String>,
}

fn usage() -> ! {
    eprintln!("toposcanctl: controller for a toposcan discovery hook");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  toposcanctl [options] --driver NAME [--addr ADDRESS]... [--new] [--driver ...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --listen ADDR        endpoint to host (default 127.0.0.1:7643)");
    eprintln!("  --mode MODE          oneshot | monitor (default oneshot)");
    eprintln!("  --logdir DIR         log directory for the hook side");
    eprintln!("  --driver NAME        open a target bus (repeatable)");
    eprintln!("  --addr ADDRESS       add an address to the last --driver (repeatable)");
    eprintln!("  --new                mark the last --driver as new to the host");
    eprintln!("  --stop-after SECS    send STOP after this many seconds");
    eprintln!("  --save-snapshots F   write the latest snapshot document to F");
    std::process::exit(2);
}

fn parse_args() -> Options {
    let mut options = Options {
        listen: "127.0.0.1:7643".to_string(),
        mode: "oneshot".to_string(),
        log_dir: None,
        drivers: Vec::new(),
        stop_after: None,
        snapshot_file: None,
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    let mut value = |i: &mut usize| -> String {
        *i += 1;
        match args.get(*i) {
            Some(v) => v.clone(),
            None => usage(),
        }
    };

    while i < args.len() {
        match args[i].as_str() {
            "--listen" => options.listen = value(&mut i),
            "--mode" => options.mode = value(&mut i),
            "--logdir" => options.log_dir = Some(value(&mut i)),
            "--driver" => {
                let name = value(&mut i);
                options.drivers.push((name, Vec::new(), false));
            }
            "--addr" => {
                let addr = value(&mut i);
                match options.drivers.last_mut() {
                    Some((_, addresses, _)) => addresses.push(addr),
                    None => usage(),
                }
            }
            "--new" => match options.drivers.last_mut() {
                Some((_, _, new_driver)) => *new_driver = true,
                None => usage(),
            },
            "--stop-after" => {
                let secs: u64 = value(&mut i).parse().unwrap_or_else(|_| usage());
                options.stop_after = Some(Duration::from_secs(secs));
            }
            "--save-snapshots" => options.snapshot_file = Some(value(&mut i)),
            _ => usage(),
        }
        i += 1;
    }

    if options.drivers.is_empty() {
        usage();
    }
    options
}

fn main() {
    let options = parse_args();

    println!("toposcanctl: hosting control channel at {}", options.listen);
    let listener = match ChannelListener::bind(&options.listen) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("[FAIL] cannot bind {}: {}", options.listen, e);
            std::process::exit(1);
        }
    };

    println!("Waiting for the hook to connect (load it into the host now)...");
    let transport = match listener.accept() {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("[FAIL] accept failed: {}", e);
            std::process::exit(1);
        }
    };
    println!("[OK] Hook connected, sending configuration");

    let mut config = Vec::new();
    config.push(format!("C|MODE={}", options.mode));
    if let Some(ref dir) = options.log_dir {
        config.push(format!("C|LOGDIR={}", dir));
    }
    for (name, addresses, new_driver) in &options.drivers {
        config.push(format!("C|DRIVER={}", name));
        for addr in addresses {
            config.push(format!("C|ADDR={}", addr));
        }
        if *new_driver {
            config.push("C|NEWDRIVER=1".to_string());
        }
    }
    config.push("C|END".to_string());

    for line in &config {
        if let Err(e) = transport.send_line(line) {
            eprintln!("[FAIL] configuration send failed: {}", e);
            std::process::exit(1);
        }
    }
    println!("[OK] Configuration sent ({} targets)", options.drivers.len());
    println!("---");

    let started = Instant::now();
    let mut stop_sent = false;
    let mut in_snapshot = false;
    let mut snapshot_doc = String::new();
    let mut last_status = None;

    loop {
        if let Some(after) = options.stop_after {
            if !stop_sent && started.elapsed() >= after {
                println!("--- sending STOP ---");
                let _ = transport.send_line("STOP");
                stop_sent = true;
            }
        }

        let line = match transport.read_line(Duration::from_millis(200)) {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(_) => {
                eprintln!("[WARN] hook disconnected without D|");
                break;
            }
        };

        match toposcan::channel::parse_report_line(&line, in_snapshot) {
            ReportLine::Log(text) => println!("  {}", text),
            ReportLine::Status {
                total,
                identified,
                events,
            } => {
                println!(
                    "[STATUS] {} devices, {} identified, {} events",
                    total, identified, events
                );
                last_status = Some((total, identified, events));
            }
            ReportLine::SnapshotBegin => {
                in_snapshot = true;
                snapshot_doc.clear();
            }
            ReportLine::Payload(text) => {
                snapshot_doc.push_str(&text);
                snapshot_doc.push('\n');
            }
            ReportLine::SnapshotEnd => {
                in_snapshot = false;
                if let Some(ref path) = options.snapshot_file {
                    if let Err(e) = std::fs::File::create(path)
                        .and_then(|mut f| f.write_all(snapshot_doc.as_bytes()))
                    {
                        eprintln!("[WARN] cannot save snapshot to {}: {}", path, e);
                    }
                }
            }
            ReportLine::Done => {
                println!("--- hook reports completion ---");
                break;
            }
        }
    }

    if !snapshot_doc.is_empty() {
        let counts = snapshot::count_devices(&snapshot_doc);
        println!("Final snapshot: {}", counts);
    }
    match last_status {
        Some((total, identified, events)) => {
            println!(
                "Result: {} devices, {} identified, {} events in {}s",
                total,
                identified,
                events,
                started.elapsed().as_secs()
            );
            // Zero identified devices is the failure signal.
            if identified == 0 {
                std::process::exit(1);
            }
        }
        None => {
            eprintln!("No status ever received");
            std::process::exit(1);
        }
    }
}
