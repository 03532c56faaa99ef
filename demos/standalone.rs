//! Stand-alone demo server.
//!
//! Publishes five demo services (device information, battery, current time,
//! a writable text string, and CPU information), then drains the battery by
//! one percent every fifteen seconds to exercise the notification path.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use gabble::{Config, DataBridge, Flags, Reject, Value};

#[derive(Clone, Copy, Debug, Parser)]
struct Args {
    /// Log errors only.
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Stop battery notifications once the level reaches zero.
    #[arg(long)]
    stop_at_empty: bool,
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let level = if args.debug {
        "trace"
    } else if args.verbose {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    // Server data values shared with the handlers through the bridge.
    let battery_level = Arc::new(AtomicU8::new(78));
    let text_string = Arc::new(Mutex::new(String::from("Hello, world!")));

    let bridge = {
        let (level, text) = (Arc::clone(&battery_level), Arc::clone(&text_string));
        let (level_w, text_w) = (Arc::clone(&battery_level), Arc::clone(&text_string));
        DataBridge::new(
            move |name| match name {
                "battery/level" => Some(Value::U8(level.load(Ordering::Relaxed))),
                "text/string" => Some(Value::Str(text.lock().unwrap().clone())),
                _ => None,
            },
            move |name, value| match (name, value.into_bytes()) {
                ("battery/level", Some(b)) if b.len() == 1 => {
                    level_w.store(b[0], Ordering::Relaxed);
                    true
                }
                ("text/string", Some(b)) => {
                    *text_w.lock().unwrap() = String::from_utf8_lossy(&b).into_owned();
                    true
                }
                _ => false,
            },
        )
    };

    spawn_signal_handler();

    let config = Config::new("gabble").advertising_names("Gabble", "Gabble");
    if !gabble::start(config, bridge, configure) {
        error!("Server failed to start");
        return std::process::ExitCode::FAILURE;
    }

    // Drop the battery level by one percent every fifteen seconds until
    // shutdown begins.
    let mut since_drain = Duration::ZERO;
    while gabble::run_state() < gabble::RunState::Stopping {
        std::thread::sleep(Duration::from_millis(250));
        since_drain += Duration::from_millis(250);
        if since_drain < Duration::from_secs(15) {
            continue;
        }
        since_drain = Duration::ZERO;
        let old = battery_level.load(Ordering::Relaxed);
        let new = old.saturating_sub(1);
        battery_level.store(new, Ordering::Relaxed);
        if new > 0 || old > 0 || !args.stop_at_empty {
            gabble::notify_updated_characteristic("/com/gabble/battery/level");
        }
    }

    if !gabble::wait() {
        return std::process::ExitCode::FAILURE;
    }
    match gabble::health() {
        gabble::Health::Ok => std::process::ExitCode::SUCCESS,
        _ => std::process::ExitCode::FAILURE,
    }
}

/// Declares the demo GATT tree.
fn configure(app: &mut gabble::Application) {
    // Device Information (org.bluetooth.service.device_information)
    app.service("device", "180A", |s| {
        s.characteristic("mfgr_name", "2A29", Flags::READ, |c| {
            c.on_read(|_| Ok(b"Acme Inc.".to_vec()));
        });
        s.characteristic("model_num", "2A24", Flags::READ, |c| {
            c.on_read(|_| Ok(b"Marvin-PA".to_vec()));
        });
    });

    // Battery service (org.bluetooth.service.battery_service). The level is
    // owned by the application; updates arrive through the notify queue.
    app.service("battery", "180F", |s| {
        s.characteristic("level", "2A19", Flags::READ | Flags::NOTIFY, |c| {
            c.on_read(|req| Ok(vec![req.bridge().u8("battery/level", 0)]));
            c.on_updated(|_| true);
        });
    });

    // Current Time service (org.bluetooth.service.current_time), refreshed
    // every tick as a connectivity smoke test.
    app.service("time", "1805", |s| {
        s.characteristic("current", "2A2B", Flags::READ | Flags::NOTIFY, |c| {
            c.on_read(|_| Ok(current_time()));
            c.on_event(1, |_| true);
        });
        s.characteristic("local", "2A0F", Flags::READ, |c| {
            c.on_read(|_| Ok(local_time_info()));
        });
    });

    // Custom read/write text string service.
    app.service("text", "00000001-1E3C-FAD4-74E2-97A033F1BFAA", |s| {
        s.characteristic(
            "string",
            "00000002-1E3C-FAD4-74E2-97A033F1BFAA",
            Flags::READ | Flags::WRITE | Flags::NOTIFY,
            |c| {
                c.on_read(|req| Ok(req.bridge().bytes("text/string", b"")));
                c.on_write(|req| {
                    let value = req.value().to_vec();
                    if !req.bridge().set("text/string", value) {
                        return Err(Reject::failed("value rejected"));
                    }
                    req.forward_update();
                    Ok(())
                });
                c.on_updated(|_| true);
                c.descriptor("description", "2901", Flags::READ, |d| {
                    d.on_read(|_| {
                        Ok(b"A mutable text string used for testing. Read and write to me, it tickles!".to_vec())
                    });
                });
            },
        );
    });

    // Custom ASCII time service: a fresh value on every read.
    app.service("ascii_time", "00000001-1E3D-FAD4-74E2-97A033F1BFEE", |s| {
        s.characteristic(
            "string",
            "00000002-1E3D-FAD4-74E2-97A033F1BFEE",
            Flags::READ,
            |c| {
                c.on_read(|_| Ok(ascii_time().into_bytes()));
                c.descriptor("description", "2901", Flags::READ, |d| {
                    d.on_read(|_| {
                        Ok(b"Returns the local time each time it is read".to_vec())
                    });
                });
            },
        );
    });

    // Custom CPU information service.
    app.service("cpu", "0000B001-1E3D-FAD4-74E2-97A033F1BFEE", |s| {
        s.characteristic(
            "count",
            "0000B002-1E3D-FAD4-74E2-97A033F1BFEE",
            Flags::READ,
            |c| {
                c.on_read(|_| Ok(cpu_info().0.to_le_bytes().to_vec()));
                c.descriptor("description", "2901", Flags::READ, |d| {
                    d.on_read(|_| {
                        Ok(b"This might represent the number of CPUs in the system".to_vec())
                    });
                });
            },
        );
        s.characteristic(
            "model",
            "0000B003-1E3D-FAD4-74E2-97A033F1BFEE",
            Flags::READ,
            |c| {
                c.on_read(|_| Ok(cpu_info().1.into_bytes()));
                c.descriptor("description", "2901", Flags::READ, |d| {
                    d.on_read(|_| {
                        Ok(b"Possibly the model of the CPU in the system".to_vec())
                    });
                });
            },
        );
    });
}

/// Runs SIGINT/SIGTERM handling on its own runtime thread.
fn spawn_signal_handler() {
    std::thread::spawn(|| {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("signal runtime");
        rt.block_on(async {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
                _ = term.recv() => info!("SIGTERM received, shutting down"),
            }
            gabble::trigger_shutdown();
        });
    });
}

fn local_tm() -> libc::tm {
    let t = unsafe { libc::time(std::ptr::null_mut()) };
    let mut tm = unsafe { std::mem::zeroed() };
    unsafe { libc::localtime_r(&t, &mut tm) };
    tm
}

/// Renders the local time in the Current Time characteristic format
/// (Exact Time 256 plus adjust reason).
fn current_time() -> Vec<u8> {
    let tm = local_tm();
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let year = (tm.tm_year + 1900) as u16;
    let mut v = Vec::with_capacity(10);
    v.extend_from_slice(&year.to_le_bytes());
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    v.extend_from_slice(&[
        (tm.tm_mon + 1) as u8,
        tm.tm_mday as u8,
        tm.tm_hour as u8,
        tm.tm_min as u8,
        tm.tm_sec as u8,
        if tm.tm_wday == 0 { 7 } else { tm.tm_wday as u8 },
        0, // fractions of a second
        0, // adjust reason
    ]);
    v
}

/// Renders the Local Time Information characteristic: timezone in quarter
/// hours plus DST offset.
fn local_time_info() -> Vec<u8> {
    let tm = local_tm();
    #[allow(clippy::cast_possible_truncation)]
    let zone = (tm.tm_gmtoff / (15 * 60)) as i8;
    let dst: u8 = if tm.tm_isdst > 0 { 4 } else { 0 };
    vec![zone as u8, dst]
}

/// Renders the local time the way `asctime` does, without the trailing
/// newline.
fn ascii_time() -> String {
    const WDAY: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    const MON: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let tm = local_tm();
    format!(
        "{} {} {:2} {:02}:{:02}:{:02} {}",
        WDAY[tm.tm_wday.rem_euclid(7) as usize],
        MON[tm.tm_mon.rem_euclid(12) as usize],
        tm.tm_mday,
        tm.tm_hour,
        tm.tm_min,
        tm.tm_sec,
        tm.tm_year + 1900
    )
}

/// Scrapes the CPU count and model from `/proc/cpuinfo`.
fn cpu_info() -> (i16, String) {
    let Ok(raw) = std::fs::read_to_string("/proc/cpuinfo") else {
        return (0, String::from("Unknown"));
    };
    let count = raw.lines().filter(|l| l.starts_with("processor")).count();
    let model = raw
        .lines()
        .find(|l| l.starts_with("model name"))
        .and_then(|l| l.split(':').nth(1))
        .map_or_else(|| String::from("Unknown"), |m| m.trim().to_owned());
    #[allow(clippy::cast_possible_truncation)]
    (count as i16, model)
}
