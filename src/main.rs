use std::io::{self, BufRead, Write};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::info;

use kvsockd::cli;
use kvsockd::handler::{
    DoubleSlot, HandlerItem, HandlerKind, HandlerResult, HandlerTable, IntSlot, StringSlot,
};
use kvsockd::logging;
use kvsockd::server::{self, Broadcaster, NoopCallbacks, ServerConfig};
use kvsockd::socket::{ClientEndpoint, SockKind};

/// Builds the demo handler table: one each of the built-in typed
/// accessors, registered the way a collaborator wires up its own
/// domain handlers, plus a `shout` handler that exercises the `SendAll`
/// broadcast capability (§5) by echoing its value out to every
/// connected client instead of just the caller.
fn build_table(broadcaster_cell: Arc<Mutex<Option<Broadcaster>>>) -> HandlerTable {
    let mut table = HandlerTable::new();
    let counter = Arc::new(IntSlot::new(0));
    table.register(HandlerItem::new(
        "counter",
        Some("integer counter, get/set"),
        HandlerKind::Plain,
        IntSlot::handler(counter),
    ));
    let gain = Arc::new(DoubleSlot::new(1.0));
    table.register(HandlerItem::new(
        "gain",
        Some("floating-point gain, get/set"),
        HandlerKind::Plain,
        DoubleSlot::handler(gain),
    ));
    let label = Arc::new(StringSlot::new(String::new()));
    table.register(HandlerItem::new(
        "label",
        Some("free-text label, get/set"),
        HandlerKind::Plain,
        StringSlot::handler(label),
    ));
    table.register(HandlerItem::new(
        "shout",
        Some("broadcast a value to every connected client"),
        HandlerKind::Plain,
        Box::new(move |_client, _item, value| {
            let text = match value {
                Some(v) => v,
                None => return HandlerResult::BadVal,
            };
            if let Some(broadcaster) = broadcaster_cell.lock().unwrap().as_ref() {
                broadcaster.send_all(format!("shout={}\n", text).as_bytes());
            }
            HandlerResult::Silence
        }),
    ));
    table
}

fn main() {
    let options = cli::parse_args(None);
    logging::init(options.logfile.as_deref(), options.verbose);
    info!("kvsockd starting, options={:?}", options);

    let kind = match &options.unixsock {
        Some(path) => SockKind::UnixPath(path.clone()),
        None => SockKind::InetAny,
    };
    let address = options
        .unixsock
        .clone()
        .or(options.node.clone())
        .unwrap_or_else(|| ":7000".to_string());

    if !options.server {
        run_client(&kind, &address);
        return;
    }

    let broadcaster_cell = Arc::new(Mutex::new(None));
    let config = ServerConfig {
        kind,
        address,
        bufsiz: 4096,
        max_clients: options.maxclients,
        default_handler: None,
        broadcaster_cell: Some(Arc::clone(&broadcaster_cell)),
    };

    let table = Arc::new(build_table(broadcaster_cell));
    let callbacks = Arc::new(NoopCallbacks);
    let shutdown = Arc::new(AtomicBool::new(false));

    if let Err(e) = server::run(config, table, callbacks, shutdown) {
        eprintln!("server exited with error: {}", e);
        std::process::exit(1);
    }
}

/// The `--server`-less role: connect to an already-running dispatcher,
/// relay stdin lines out as commands, and print back whatever the
/// server sends in reply. Exits on EOF or once the connection drops.
fn run_client(kind: &SockKind, address: &str) {
    let endpoint = match ClientEndpoint::connect(kind, address, 4096) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("could not connect to {}: {}", address, e);
            std::process::exit(1);
        }
    };

    let reader_endpoint = Arc::clone(&endpoint);
    let printer = thread::spawn(move || {
        let mut scratch = [0u8; 512];
        while reader_endpoint.is_connected() {
            match reader_endpoint.read_line(&mut scratch) {
                Ok(Some(n)) => {
                    let line = String::from_utf8_lossy(&scratch[..n]);
                    println!("{}", line);
                }
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        }
    });

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if !endpoint.is_connected() {
            break;
        }
        if endpoint.send_str(&line) < 0 {
            break;
        }
        if endpoint.send_byte(b'\n') < 0 {
            break;
        }
    }
    io::stdout().flush().ok();
    let _ = printer.join();
}
