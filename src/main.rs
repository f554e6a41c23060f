/*
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::{crate_version, App, Arg};
use log::{error, info, LevelFilter};
use portico::config::Settings;
use portico::endpoint::{Endpoint, Handler, SocketState};
use portico::logger::get_simple_logger;
use portico::net::Conn;
use std::error::Error;
use std::io::{Read, Write};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Trivial demo handler: echoes whatever it reads and keeps the connection
/// alive for the next request.
struct EchoHandler;

impl Handler for EchoHandler {
    fn process(&self, conn: &mut Conn) -> SocketState {
        let mut buf = [0u8; 16384];

        let n = match conn.read(&mut buf) {
            Ok(0) | Err(_) => return SocketState::Closed,
            Ok(n) => n,
        };

        if conn.write_all(&buf[..n]).is_err() {
            return SocketState::Closed;
        }

        SocketState::Long
    }
}

struct Args {
    config_file: Option<String>,
    port: Option<u16>,
    address: Option<String>,
    max_threads: Option<i32>,
}

fn process_args_and_run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut settings = match &args.config_file {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };

    if let Some(port) = args.port {
        settings.port = port;
    }

    if args.address.is_some() {
        settings.address = args.address;
    }

    if let Some(max_threads) = args.max_threads {
        settings.max_threads = max_threads;
    }

    let endpoint = Endpoint::new(settings, Arc::new(EchoHandler))?;

    endpoint.start()?;

    let addr = endpoint.local_addr().expect("endpoint is started");
    info!("listening on {}", addr);

    let stop = Arc::new(AtomicBool::new(false));

    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    info!("stopping");

    endpoint.stop();
    endpoint.destroy();

    Ok(())
}

fn main() {
    let matches = App::new("portico")
        .version(crate_version!())
        .about("TCP connection endpoint")
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .value_name("N")
                .help("Log level")
                .default_value("2"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .value_name("FILE")
                .help("Config file"),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .value_name("PORT")
                .help("Port to listen on"),
        )
        .arg(
            Arg::with_name("address")
                .long("address")
                .takes_value(true)
                .value_name("ADDR")
                .help("Address to bind"),
        )
        .arg(
            Arg::with_name("max-threads")
                .long("max-threads")
                .takes_value(true)
                .value_name("N")
                .help("Worker thread limit (negative means unbounded)"),
        )
        .get_matches();

    log::set_logger(get_simple_logger()).expect("failed to set logger");

    let level = matches.value_of("log-level").unwrap();

    let level: usize = match level.parse() {
        Ok(x) => x,
        Err(e) => {
            eprintln!("failed to parse log-level: {}", e);
            process::exit(1);
        }
    };

    let level = match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    log::set_max_level(level);

    let port = match matches.value_of("port").map(str::parse) {
        None => None,
        Some(Ok(x)) => Some(x),
        Some(Err(e)) => {
            eprintln!("failed to parse port: {}", e);
            process::exit(1);
        }
    };

    let max_threads = match matches.value_of("max-threads").map(str::parse) {
        None => None,
        Some(Ok(x)) => Some(x),
        Some(Err(e)) => {
            eprintln!("failed to parse max-threads: {}", e);
            process::exit(1);
        }
    };

    let args = Args {
        config_file: matches.value_of("config").map(String::from),
        port,
        address: matches.value_of("address").map(String::from),
        max_threads,
    };

    if let Err(e) = process_args_and_run(args) {
        error!("{}", e);
        process::exit(1);
    }
}
