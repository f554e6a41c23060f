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

use crate::endpoint::{apply_thread_priority, Core, SocketStatus};
use crate::net::Conn;
use crate::pollset::{PollSet, Readiness};
use log::{debug, error, info};
use mio::Interest;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// fallback sizes when the platform rejects a large poll set
const FALLBACK_SIZE: usize = 1024;
const FALLBACK_SIZE_MIN: usize = 62;

struct PollerShared {
    name: String,
    comet: bool,
    size: usize,
    queue: Mutex<Vec<Conn>>,
    cond: Condvar,
    stop: AtomicBool,
    keep_alive_count: AtomicUsize,
}

impl PollerShared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Keep-alive poller. Absorbs idle sockets through a bounded add queue,
/// registers them for readability, and dispatches them back to the worker
/// pool when they become readable, error out, or time out. The comet flag
/// selects the close-path policy: comet pollers deliver lifecycle events to
/// the handler, normal pollers close the socket directly.
pub struct Poller {
    shared: Arc<PollerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

fn create_set(size: usize, entry_timeout_ms: i64) -> io::Result<(PollSet<Conn>, usize)> {
    let entry_timeout = if entry_timeout_ms > 0 {
        Some(Duration::from_millis(entry_timeout_ms as u64))
    } else {
        None
    };

    match PollSet::new(size, entry_timeout) {
        Ok(set) => return Ok((set, size)),
        Err(e) => info!("poll set of size {} failed: {}", size, e),
    }

    if size > FALLBACK_SIZE {
        if let Ok(set) = PollSet::new(FALLBACK_SIZE, entry_timeout) {
            return Ok((set, FALLBACK_SIZE));
        }
    }

    let set = PollSet::new(FALLBACK_SIZE_MIN, entry_timeout)?;

    Ok((set, FALLBACK_SIZE_MIN))
}

impl Poller {
    pub(crate) fn new(
        core: &Arc<Core>,
        index: usize,
        comet: bool,
        size: usize,
    ) -> io::Result<Self> {
        let (set, size) = create_set(size, core.settings.keep_alive_timeout_effective())?;

        let kind = if comet { "CometPoller" } else { "Poller" };
        let name = format!("{}-{}-{}", core.settings.name, kind, index);

        let shared = Arc::new(PollerShared {
            name: name.clone(),
            comet,
            size,
            queue: Mutex::new(Vec::with_capacity(size)),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            keep_alive_count: AtomicUsize::new(0),
        });

        let thread = {
            let core = Arc::clone(core);
            let shared = Arc::clone(&shared);
            let priority = core.settings.thread_priority;

            thread::Builder::new().name(name).spawn(move || {
                apply_thread_priority(priority);
                run(core, shared, set);
            })?
        };

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues a socket for keep-alive polling. It becomes eligible at the
    /// next poll iteration, at most one poll quantum later. A full queue
    /// closes the socket right away.
    pub(crate) fn add(&self, core: &Arc<Core>, conn: Conn) {
        let mut queue = self.shared.queue.lock().unwrap();

        if queue.len() >= self.shared.size {
            drop(queue);

            debug!(
                "{}: add queue full, closing connection from {}",
                self.shared.name,
                conn.peer_addr()
            );

            close_path(core, &self.shared, conn, SocketStatus::Error);

            return;
        }

        queue.push(conn);

        self.shared.cond.notify_one();
    }

    pub(crate) fn keep_alive_count(&self) -> usize {
        self.shared.keep_alive_count.load(Ordering::Relaxed)
    }

    /// Signals the poll thread to shut down and joins it. The thread closes
    /// every socket it still holds on the way out.
    pub(crate) fn destroy(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);

        {
            let _queue = self.shared.queue.lock().unwrap();
            self.shared.cond.notify_all();
        }

        let thread = self.thread.lock().unwrap().take();

        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }
}

fn close_path(core: &Arc<Core>, shared: &PollerShared, conn: Conn, status: SocketStatus) {
    if shared.comet {
        if let Err(conn) = core.process_socket_event(conn, status) {
            core.destroy_socket(conn);
        }
    } else {
        core.destroy_socket(conn);
    }
}

fn run(core: Arc<Core>, shared: Arc<PollerShared>, mut set: PollSet<Conn>) {
    let poll_time_us = core.settings.poll_time as u64;
    let poll_time = Duration::from_micros(poll_time_us);
    let so_timeout = core.settings.so_timeout;

    let mut events: Vec<(usize, Readiness)> = Vec::with_capacity(shared.size);
    let mut maintain_time: u64 = 0;

    while core.running() && !shared.stopping() {
        while core.paused() && core.running() && !shared.stopping() {
            thread::sleep(Duration::from_secs(1));
        }

        if !core.running() || shared.stopping() {
            break;
        }

        if set.is_empty() {
            let mut queue = shared.queue.lock().unwrap();

            while queue.is_empty() && core.running() && !shared.stopping() {
                maintain_time = 0;
                queue = shared.cond.wait(queue).unwrap();
            }
        }

        if !core.running() || shared.stopping() {
            break;
        }

        // move waiting sockets into the poll set
        let failed = {
            let mut queue = shared.queue.lock().unwrap();

            let mut success = 0;
            let mut failed = Vec::new();

            for conn in queue.drain(..) {
                match set.add(conn, Interest::READABLE) {
                    Ok(_) => success += 1,
                    Err((conn, e)) => {
                        debug!(
                            "{}: failed to register connection from {}: {}",
                            shared.name,
                            conn.peer_addr(),
                            e
                        );

                        failed.push(conn);
                    }
                }
            }

            shared.keep_alive_count.fetch_add(success, Ordering::Relaxed);

            failed
        };

        for conn in failed {
            close_path(&core, &shared, conn, SocketStatus::Error);
        }

        maintain_time += poll_time_us;

        match set.poll(poll_time, &mut events) {
            Ok(()) => {
                for (key, readiness) in events.drain(..) {
                    let conn = match set.take(key) {
                        Some(conn) => conn,
                        None => continue,
                    };

                    shared.keep_alive_count.fetch_sub(1, Ordering::Relaxed);

                    if readiness.hup || readiness.error {
                        close_path(&core, &shared, conn, SocketStatus::Disconnect);
                        continue;
                    }

                    let result = if shared.comet {
                        core.process_socket_event(conn, SocketStatus::Open)
                    } else {
                        core.process_socket(conn)
                    };

                    if let Err(conn) = result {
                        close_path(&core, &shared, conn, SocketStatus::Disconnect);
                    }
                }
            }
            Err(e) => {
                // a non-interrupt poll failure is critical: rebuild the poll
                // set, closing everything it held
                error!("{}: poll failed: {}", shared.name, e);

                set = reinit(&core, &shared, set);
                maintain_time = 0;

                continue;
            }
        }

        if so_timeout > 0 && maintain_time > 1_000_000 && core.running() {
            for conn in set.maintain(Instant::now()) {
                shared.keep_alive_count.fetch_sub(1, Ordering::Relaxed);

                debug!(
                    "{}: keep-alive timeout for {}",
                    shared.name,
                    conn.peer_addr()
                );

                close_path(&core, &shared, conn, SocketStatus::Timeout);
            }

            maintain_time = 0;
        }
    }

    shutdown_drain(&core, &shared, &mut set);
}

fn reinit(core: &Arc<Core>, shared: &Arc<PollerShared>, mut old: PollSet<Conn>) -> PollSet<Conn> {
    shutdown_drain(core, shared, &mut old);

    loop {
        match create_set(shared.size, core.settings.keep_alive_timeout_effective()) {
            Ok((set, _)) => return set,
            Err(e) => error!("{}: failed to rebuild poll set: {}", shared.name, e),
        }

        if !core.running() || shared.stopping() {
            // the drained old set serves until the loop exits
            return old;
        }

        thread::sleep(Duration::from_secs(1));
    }
}

fn shutdown_drain(core: &Arc<Core>, shared: &Arc<PollerShared>, set: &mut PollSet<Conn>) {
    let queued: Vec<Conn> = shared.queue.lock().unwrap().drain(..).collect();

    for conn in queued {
        close_path(core, shared, conn, SocketStatus::Stop);
    }

    for conn in set.drain() {
        close_path(core, shared, conn, SocketStatus::Stop);
    }

    shared.keep_alive_count.store(0, Ordering::Relaxed);
}
