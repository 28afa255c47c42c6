//! pktlink Echo Server
//!
//! Single-threaded packet server on one epoll loop.
//!
//! Methods:
//!     ping          -> ACK "i" 42
//!     echo "s"      -> ACK "s" with the same string
//!
//! Usage:
//!     cargo build --release -p pktlink-echo
//!     ./target/release/pktlink-echo [address]
//!
//! The address is a socket path or an abstract name (`@pktlink.echo`,
//! the default). Test with:
//!     ./target/release/pktlink-call @pktlink.echo ping -r i
//!     ./target/release/pktlink-call @pktlink.echo echo s hello -r s

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use pktlink::{
    pk_info, CallbackControl, Connector, ConnectorEvent, EventLoop, MethodTable, Packet,
    PacketSession, RuntimeConfig, Value,
};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    STOP.store(true, Ordering::Release);
}

#[derive(Default)]
struct Stats {
    connects: Cell<u64>,
    disconnects: Cell<u64>,
    requests: Cell<u64>,
}

fn methods(stats: &Rc<Stats>) -> MethodTable {
    let ping_stats = Rc::clone(stats);
    let echo_stats = Rc::clone(stats);
    MethodTable::new()
        .with("ping", move |pid, fd, req| {
            ping_stats.requests.set(ping_stats.requests.get() + 1);
            pk_info!("echo", "fd={} pid={} ping seq={}", fd, pid, req.seq());
            Packet::create_reply(req, "i", &[Value::Int(42)]).ok()
        })
        .with("echo", move |pid, fd, req| {
            echo_stats.requests.set(echo_stats.requests.get() + 1);
            let text = req.reader().read_str().unwrap_or("").to_owned();
            pk_info!("echo", "fd={} pid={} echo {:?}", fd, pid, text);
            Packet::create_reply(req, "s", &[Value::Str(text)]).ok()
        })
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let address = args
        .get(1)
        .cloned()
        .unwrap_or_else(|| "@pktlink.echo".to_string());

    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let config = RuntimeConfig::from_env();
    let ev = match EventLoop::with_config(&config) {
        Ok(ev) => ev,
        Err(e) => {
            eprintln!("pktlink-echo: event loop: {}", e);
            std::process::exit(1);
        }
    };
    let connector = Connector::with_config(ev.clone(), &config);
    let session = PacketSession::new(connector.clone());

    let stats = Rc::new(Stats::default());
    let s = Rc::clone(&stats);
    connector.add_event_callback(
        ConnectorEvent::Connected,
        Box::new(move |_| {
            s.connects.set(s.connects.get() + 1);
            CallbackControl::Keep
        }),
    );
    let s = Rc::clone(&stats);
    connector.add_event_callback(
        ConnectorEvent::Disconnected,
        Box::new(move |_| {
            s.disconnects.set(s.disconnects.get() + 1);
            CallbackControl::Keep
        }),
    );

    let listener = match session.server_init(&address, methods(&stats)) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("pktlink-echo: cannot listen on {}: {}", address, e);
            std::process::exit(1);
        }
    };
    eprintln!("pktlink-echo: listening on {} (fd {})", address, listener);

    while !STOP.load(Ordering::Acquire) {
        if let Err(e) = ev.run_once(Some(config.poll_timeout)) {
            eprintln!("pktlink-echo: event loop: {}", e);
            break;
        }
    }

    session.server_fini(listener);
    if !address.starts_with('@') {
        let _ = std::fs::remove_file(&address);
    }
    eprintln!(
        "pktlink-echo: done, {} connects, {} disconnects, {} requests",
        stats.connects.get(),
        stats.disconnects.get(),
        stats.requests.get()
    );
}
