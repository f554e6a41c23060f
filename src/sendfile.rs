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

use crate::endpoint::{apply_thread_priority, Core};
use crate::net::Conn;
use crate::pollset::{PollSet, Readiness};
use log::{debug, error, info};
use mio::Interest;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const FALLBACK_SIZE: usize = 1024;
const FALLBACK_SIZE_MIN: usize = 62;

/// Whether the platform has a kernel sendfile this endpoint can drive.
pub fn supported() -> bool {
    cfg!(target_os = "linux")
}

#[cfg(target_os = "linux")]
fn sendfile_n(socket: RawFd, file: RawFd, pos: &mut u64, count: u64) -> io::Result<u64> {
    let mut offset = *pos as libc::off_t;

    let ret = unsafe { libc::sendfile(socket, file, &mut offset, count as libc::size_t) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    *pos = offset as u64;

    Ok(ret as u64)
}

#[cfg(not(target_os = "linux"))]
fn sendfile_n(_socket: RawFd, _file: RawFd, _pos: &mut u64, _count: u64) -> io::Result<u64> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// An outstanding file range transfer. Owns the connection and the open
/// file for the duration of the transfer; both are released when the
/// transfer concludes, whichever way it concludes.
pub struct SendfileData {
    file_name: PathBuf,
    file: Option<File>,
    start: u64,
    end: u64,
    pos: u64,
    keep_alive: bool,
    conn: Conn,
}

impl SendfileData {
    pub fn new(file_name: PathBuf, start: u64, end: u64, keep_alive: bool, conn: Conn) -> Self {
        Self {
            file_name,
            file: None,
            start,
            end,
            pos: start,
            keep_alive,
            conn,
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub(crate) fn into_conn(self) -> Conn {
        self.conn
    }
}

impl AsRawFd for SendfileData {
    fn as_raw_fd(&self) -> RawFd {
        self.conn.as_raw_fd()
    }
}

/// Outcome of handing a transfer to the sendfile stage.
pub enum SendfileStatus {
    /// The whole range was written inline; the caller keeps the connection.
    Done(Conn),
    /// The kernel blocked partway; the sendfile stage owns the transfer now.
    Pending,
    /// Open or write failure. File resources are released; the caller must
    /// destroy the connection.
    Failed(Conn),
}

enum Progress {
    Blocked,
    Complete,
    Failed,
}

fn drive(data: &mut SendfileData) -> Progress {
    let file = match &data.file {
        Some(file) => file,
        None => return Progress::Failed,
    };

    let socket_fd = data.conn.as_raw_fd();
    let file_fd = file.as_raw_fd();

    while data.pos < data.end {
        let remaining = data.end - data.pos;
        match sendfile_n(socket_fd, file_fd, &mut data.pos, remaining) {
            Ok(0) => {
                error!("sendfile: file {:?} ends before offset {}", data.file_name, data.end);
                return Progress::Failed;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Progress::Blocked,
            Err(e) => {
                error!("sendfile failed for {:?}: {}", data.file_name, e);
                return Progress::Failed;
            }
        }
    }

    Progress::Complete
}

struct SendfileShared {
    name: String,
    size: usize,
    queue: Mutex<Vec<SendfileData>>,
    cond: Condvar,
    stop: AtomicBool,
    count: AtomicUsize,
}

impl SendfileShared {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Sendfile stage. Transfers that can't complete inline park here, with
/// their sockets registered for writability, until the kernel accepts the
/// rest of the range.
pub struct Sendfile {
    shared: Arc<SendfileShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

fn create_set(size: usize, entry_timeout_ms: i64) -> io::Result<(PollSet<SendfileData>, usize)> {
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

impl Sendfile {
    pub(crate) fn new(core: &Arc<Core>, index: usize, size: usize) -> io::Result<Self> {
        let (set, size) = create_set(size, core.settings.so_timeout)?;

        let name = format!("{}-Sendfile-{}", core.settings.name, index);

        let shared = Arc::new(SendfileShared {
            name: name.clone(),
            size,
            queue: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            count: AtomicUsize::new(0),
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

    /// Starts a transfer. The file is opened, the socket switched to
    /// non-blocking mode, and as much of the range as the kernel will take
    /// is written inline. Most transfers finish here without ever touching
    /// the poll loop.
    pub(crate) fn add(&self, core: &Arc<Core>, mut data: SendfileData) -> SendfileStatus {
        let file = match File::open(&data.file_name) {
            Ok(file) => file,
            Err(e) => {
                error!("failed to open {:?}: {}", data.file_name, e);
                return SendfileStatus::Failed(data.conn);
            }
        };

        data.file = Some(file);
        data.pos = data.start;

        if let Err(e) = data.conn.set_io_timeout(0) {
            error!("failed to make socket non-blocking: {}", e);
            return SendfileStatus::Failed(data.conn);
        }

        match drive(&mut data) {
            Progress::Complete => {
                data.file = None;

                // back to blocking mode for any further requests
                let _ = data.conn.set_io_timeout(core.settings.so_timeout);

                SendfileStatus::Done(data.conn)
            }
            Progress::Failed => {
                data.file = None;

                SendfileStatus::Failed(data.conn)
            }
            Progress::Blocked => {
                let mut queue = self.shared.queue.lock().unwrap();

                queue.push(data);

                self.shared.cond.notify_one();

                SendfileStatus::Pending
            }
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.shared.count.load(Ordering::Relaxed)
    }

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

fn run(core: Arc<Core>, shared: Arc<SendfileShared>, mut set: PollSet<SendfileData>) {
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

        // register queued transfers for writability
        {
            let mut queue = shared.queue.lock().unwrap();

            let mut success = 0;

            for data in queue.drain(..) {
                match set.add(data, Interest::WRITABLE) {
                    Ok(_) => success += 1,
                    Err((data, e)) => {
                        error!(
                            "{}: failed to register connection from {}: {}",
                            shared.name,
                            data.conn.peer_addr(),
                            e
                        );

                        core.destroy_socket(data.into_conn());
                    }
                }
            }

            shared.count.fetch_add(success, Ordering::Relaxed);
        }

        maintain_time += poll_time_us;

        match set.poll(poll_time, &mut events) {
            Ok(()) => {
                for (key, readiness) in events.drain(..) {
                    if readiness.hup || readiness.error {
                        if let Some(data) = set.take(key) {
                            shared.count.fetch_sub(1, Ordering::Relaxed);
                            core.destroy_socket(data.into_conn());
                        }

                        continue;
                    }

                    let progress = match set.get_mut(key) {
                        Some(data) => drive(data),
                        None => continue,
                    };

                    match progress {
                        Progress::Blocked => set.touch(key),
                        Progress::Failed => {
                            if let Some(data) = set.take(key) {
                                shared.count.fetch_sub(1, Ordering::Relaxed);
                                core.destroy_socket(data.into_conn());
                            }
                        }
                        Progress::Complete => {
                            let mut data = match set.take(key) {
                                Some(data) => data,
                                None => continue,
                            };

                            shared.count.fetch_sub(1, Ordering::Relaxed);

                            data.file = None;

                            if data.keep_alive {
                                let _ = data.conn.set_io_timeout(so_timeout);

                                debug!(
                                    "{}: transfer of {:?} complete, back to keep-alive",
                                    shared.name, data.file_name
                                );

                                core.keep_alive(data.into_conn());
                            } else {
                                core.destroy_socket(data.into_conn());
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!("{}: poll failed: {}", shared.name, e);

                set = reinit(&core, &shared, set);
                maintain_time = 0;

                continue;
            }
        }

        if so_timeout > 0 && maintain_time > 1_000_000 && core.running() {
            for data in set.maintain(Instant::now()) {
                shared.count.fetch_sub(1, Ordering::Relaxed);

                debug!(
                    "{}: transfer of {:?} timed out",
                    shared.name, data.file_name
                );

                core.destroy_socket(data.into_conn());
            }

            maintain_time = 0;
        }
    }

    shutdown_drain(&core, &shared, &mut set);
}

fn reinit(
    core: &Arc<Core>,
    shared: &Arc<SendfileShared>,
    mut old: PollSet<SendfileData>,
) -> PollSet<SendfileData> {
    shutdown_drain(core, shared, &mut old);

    loop {
        match create_set(shared.size, core.settings.so_timeout) {
            Ok((set, _)) => return set,
            Err(e) => error!("{}: failed to rebuild poll set: {}", shared.name, e),
        }

        if !core.running() || shared.stopping() {
            return old;
        }

        thread::sleep(Duration::from_secs(1));
    }
}

fn shutdown_drain(core: &Arc<Core>, shared: &Arc<SendfileShared>, set: &mut PollSet<SendfileData>) {
    let queued: Vec<SendfileData> = shared.queue.lock().unwrap().drain(..).collect();

    for data in queued {
        core.destroy_socket(data.into_conn());
    }

    for data in set.drain() {
        core.destroy_socket(data.into_conn());
    }

    shared.count.store(0, Ordering::Relaxed);
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sendfile_writes_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let opened = File::open(file.path()).unwrap();

        let mut pos: u64 = 2;
        let n = sendfile_n(server.as_raw_fd(), opened.as_raw_fd(), &mut pos, 5).unwrap();

        assert_eq!(n, 5);
        assert_eq!(pos, 7);

        drop(server);

        let mut received = Vec::new();
        use std::io::Read;
        let mut client = client;
        client.read_to_end(&mut received).unwrap();

        assert_eq!(&received, b"23456");
    }

    #[test]
    fn supported_on_linux() {
        assert!(supported());
    }
}
