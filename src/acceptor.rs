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

use crate::endpoint::Core;
use crate::net::Conn;
use log::{debug, error, warn};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// benign accept error code on HP-UX, downgraded to a warning
const HPUX_BENIGN_ERRNO: i32 = 233;

/// Accept loop. Blocks on the listening socket while the endpoint runs,
/// handing each connection to the dispatch path. The pause/stop paths wake
/// it with a loopback connection.
pub(crate) fn run(core: Arc<Core>, listener: Arc<TcpListener>) {
    while core.running() {
        // idle while paused
        while core.paused() && core.running() {
            thread::sleep(Duration::from_secs(1));
        }

        if !core.running() {
            break;
        }

        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let conn = Conn::new(stream, peer_addr);

                // with deferred accept the wake-up connection had to send
                // data to get here. it is rubbish, discard it
                if core.defer_accept() && (core.paused() || !core.running()) {
                    core.destroy_socket(conn);
                    continue;
                }

                debug!("accepted connection from {}", peer_addr);

                if let Err(conn) = core.process_socket_with_options(conn) {
                    core.destroy_socket(conn);
                }
            }
            Err(e) => {
                if core.running() {
                    if e.raw_os_error() == Some(HPUX_BENIGN_ERRNO) {
                        warn!("accept error: {:?}", e);
                    } else {
                        error!("accept error: {:?}", e);
                    }
                }
            }
        }
    }
}
