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

use crate::endpoint::{apply_thread_priority, Core, SocketState, SocketStatus};
use crate::net::Conn;
use log::{debug, error, info};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// One unit of work handed to a worker: a connection, an optional status
/// event, and whether socket options (and the TLS handshake) still need to
/// be applied.
pub(crate) struct Assignment {
    pub conn: Conn,
    pub status: Option<SocketStatus>,
    pub options: bool,
}

struct WorkerState {
    assignment: Option<Assignment>,
    available: bool,
    retired: bool,
}

struct WorkerInner {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

/// Handle to a worker thread. Assignment is a single-producer rendezvous:
/// the producer waits for the previous assignment to be claimed, stores the
/// next one, and flips `available`; the worker thread claims it and flips
/// `available` back.
#[derive(Clone)]
pub(crate) struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    fn new() -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                state: Mutex::new(WorkerState {
                    assignment: None,
                    available: false,
                    retired: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub(crate) fn assign(&self, conn: Conn, status: Option<SocketStatus>, options: bool) {
        let mut state = self.inner.state.lock().unwrap();

        // wait for the worker to claim the previous assignment
        while state.available {
            state = self.inner.cond.wait(state).unwrap();
        }

        state.assignment = Some(Assignment {
            conn,
            status,
            options,
        });
        state.available = true;

        self.inner.cond.notify_all();
    }

    fn await_assignment(&self) -> Option<Assignment> {
        let mut state = self.inner.state.lock().unwrap();

        loop {
            if state.available {
                let assignment = state.assignment.take();
                state.available = false;

                self.inner.cond.notify_all();

                return assignment;
            }

            if state.retired {
                return None;
            }

            state = self.inner.cond.wait(state).unwrap();
        }
    }

    fn retire(&self) {
        let mut state = self.inner.state.lock().unwrap();

        state.retired = true;

        self.inner.cond.notify_all();
    }

    fn run(core: Arc<Core>, me: Worker) {
        loop {
            let assignment = match me.await_assignment() {
                Some(a) => a,
                None => break,
            };

            process_assignment(&core, assignment);

            core.workers.recycle(me.clone());
        }
    }
}

/// Runs one assignment to completion. Used by worker threads and, when an
/// external executor is installed, by per-dispatch tasks.
pub(crate) fn process_assignment(core: &Arc<Core>, assignment: Assignment) {
    let Assignment {
        mut conn,
        status,
        options,
    } = assignment;

    if !core.defer_accept() && options {
        // fresh socket with no deferred accept: apply options and park it in
        // a poller until the first request arrives
        if core.set_socket_options(&mut conn) {
            core.keep_alive(conn);
        } else {
            core.destroy_socket(conn);
        }

        return;
    }

    if let Some(status) = status {
        let state = core.handler.event(&mut conn, status);

        finish(core, conn, state, true);
    } else {
        if options && !core.set_socket_options(&mut conn) {
            core.destroy_socket(conn);
            return;
        }

        let state = core.handler.process(&mut conn);

        finish(core, conn, state, false);
    }
}

fn finish(core: &Arc<Core>, conn: Conn, state: SocketState, comet: bool) {
    if conn.is_detached() {
        // the handler took the connection, e.g. for a sendfile transfer
        return;
    }

    match state {
        SocketState::Closed => core.destroy_socket(conn),
        SocketState::Long => {
            if comet {
                core.comet_keep_alive(conn);
            } else {
                core.keep_alive(conn);
            }
        }
        SocketState::Open => {
            // Open means the handler handed the connection off, which
            // requires detaching it. nothing refers to this one anymore
            debug!(
                "conn {}: open result without detach, closing",
                conn.peer_addr()
            );

            core.destroy_socket(conn);
        }
    }
}

struct WorkerStack {
    entries: Vec<Worker>,
    limit: Option<usize>,
}

impl WorkerStack {
    fn new(limit: Option<usize>) -> Self {
        Self {
            entries: Vec::with_capacity(limit.unwrap_or(0)),
            limit,
        }
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    /// Pushes an idle worker. If the stack is full (for example after it
    /// has been resized down) the worker is handed back for retirement.
    fn push(&mut self, worker: Worker) -> Option<Worker> {
        if let Some(limit) = self.limit {
            if self.entries.len() >= limit {
                return Some(worker);
            }
        }

        self.entries.push(worker);

        None
    }

    fn pop(&mut self) -> Option<Worker> {
        self.entries.pop()
    }

    /// Changes the capacity, returning any workers that no longer fit.
    fn resize(&mut self, limit: Option<usize>) -> Vec<Worker> {
        self.limit = limit;

        let mut dropped = Vec::new();

        if let Some(limit) = limit {
            while self.entries.len() > limit {
                dropped.push(self.entries.pop().unwrap());
            }
        }

        dropped
    }
}

fn stack_limit(max_threads: i32) -> Option<usize> {
    if max_threads < 0 {
        None
    } else {
        Some(max_threads as usize)
    }
}

struct PoolState {
    stack: WorkerStack,
    max_threads: i32,
    cur_threads: usize,
    cur_threads_busy: usize,
    sequence: usize,
    closed: bool,
    max_reached_logged: bool,
}

/// Bounded pool of worker threads. Idle workers park on a LIFO stack;
/// callers that find the pool exhausted block on the pool's condition
/// variable until a worker recycles. `cur_threads` always equals the idle
/// stack size plus `cur_threads_busy`.
pub(crate) struct WorkerPool {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                stack: WorkerStack::new(Some(0)),
                max_threads: 0,
                cur_threads: 0,
                cur_threads_busy: 0,
                sequence: 0,
                closed: true,
                max_reached_logged: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn open(&self, max_threads: i32) {
        let mut state = self.state.lock().unwrap();

        state.stack = WorkerStack::new(stack_limit(max_threads));
        state.max_threads = max_threads;
        state.cur_threads = 0;
        state.cur_threads_busy = 0;
        state.closed = false;
        state.max_reached_logged = false;
    }

    /// Returns a worker, blocking until one is available. Returns None once
    /// the pool has been shut down, or when the endpoint is stopping and no
    /// worker frees up within a grace period.
    pub(crate) fn get(&self, core: &Arc<Core>) -> Option<Worker> {
        let mut state = self.state.lock().unwrap();

        loop {
            if state.closed {
                return None;
            }

            if let Some(worker) = Self::create(core, &mut state) {
                return Some(worker);
            }

            let (next, result) = self
                .cond
                .wait_timeout(state, Duration::from_secs(1))
                .unwrap();

            state = next;

            if result.timed_out() && !core.running() {
                return None;
            }
        }
    }

    fn create(core: &Arc<Core>, state: &mut PoolState) -> Option<Worker> {
        if let Some(worker) = state.stack.pop() {
            state.cur_threads_busy += 1;
            return Some(worker);
        }

        let bounded_spawn =
            state.max_threads > 0 && state.cur_threads < state.max_threads as usize;
        let unbounded = state.max_threads < 0;

        if !bounded_spawn && !unbounded {
            return None;
        }

        match Self::spawn(core, state) {
            Ok(worker) => {
                state.cur_threads += 1;
                state.cur_threads_busy += 1;

                if bounded_spawn
                    && state.cur_threads_busy == state.max_threads as usize
                    && !state.max_reached_logged
                {
                    info!(
                        "all {} worker threads are busy",
                        state.max_threads
                    );
                    state.max_reached_logged = true;
                }

                Some(worker)
            }
            Err(e) => {
                error!("failed to spawn worker thread: {}", e);
                None
            }
        }
    }

    fn spawn(core: &Arc<Core>, state: &mut PoolState) -> io::Result<Worker> {
        state.sequence += 1;

        let name = format!("{}-{}", core.settings.name, state.sequence);

        let worker = Worker::new();

        let thread_worker = worker.clone();
        let core = Arc::clone(core);
        let priority = core.settings.thread_priority;

        thread::Builder::new().name(name).spawn(move || {
            apply_thread_priority(priority);
            Worker::run(core, thread_worker);
        })?;

        Ok(worker)
    }

    pub(crate) fn recycle(&self, worker: Worker) {
        let mut state = self.state.lock().unwrap();

        state.cur_threads_busy -= 1;

        if state.closed {
            state.cur_threads -= 1;
            worker.retire();
        } else if let Some(worker) = state.stack.push(worker) {
            // the stack shrank underneath us
            state.cur_threads -= 1;
            worker.retire();
        }

        self.cond.notify_one();
    }

    /// Live-resizes the pool. Idle workers beyond the new bound retire
    /// immediately; busy workers retire as they recycle.
    pub(crate) fn resize(&self, max_threads: i32) {
        let mut state = self.state.lock().unwrap();

        state.max_threads = max_threads;

        let dropped = state.stack.resize(stack_limit(max_threads));

        state.cur_threads -= dropped.len();

        for worker in dropped {
            worker.retire();
        }

        self.cond.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();

        state.closed = true;

        let dropped: Vec<Worker> = {
            let mut v = Vec::new();

            while let Some(worker) = state.stack.pop() {
                v.push(worker);
            }

            v
        };

        state.cur_threads -= dropped.len();

        for worker in dropped {
            worker.retire();
        }

        self.cond.notify_all();
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.state.lock().unwrap().stack.size()
    }

    pub(crate) fn cur_threads(&self) -> usize {
        self.state.lock().unwrap().cur_threads
    }

    pub(crate) fn cur_threads_busy(&self) -> usize {
        self.state.lock().unwrap().cur_threads_busy
    }
}
