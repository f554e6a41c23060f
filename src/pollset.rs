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

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::cmp;
use std::io;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

const EVENTS_MAX: usize = 1024;

/// Readiness reported for one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
    pub error: bool,
}

struct Entry<T> {
    value: T,
    expires: Option<Instant>,
}

/// A bounded poll set. Each entry owns its value, is registered for a fixed
/// interest, and carries an expiry derived from the set's entry timeout.
/// `maintain` sweeps out entries whose expiry has passed; `touch` restarts
/// an entry's clock. Interrupted kernel polls are reported as an empty
/// result; any other poll failure is surfaced so the owner can rebuild the
/// set.
pub struct PollSet<T> {
    poll: Poll,
    events: Events,
    entries: Slab<Entry<T>>,
    entry_timeout: Option<Duration>,
}

impl<T: AsRawFd> PollSet<T> {
    pub fn new(size: usize, entry_timeout: Option<Duration>) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(cmp::min(size, EVENTS_MAX)),
            entries: Slab::with_capacity(size),
            entry_timeout,
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, value: T, interest: Interest) -> Result<usize, (T, io::Error)> {
        if self.entries.len() == self.entries.capacity() {
            return Err((value, io::Error::from(io::ErrorKind::WriteZero)));
        }

        let fd = value.as_raw_fd();

        let entry = self.entries.vacant_entry();
        let key = entry.key();

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(key), interest)
        {
            return Err((value, e));
        }

        entry.insert(Entry {
            value,
            expires: self.entry_timeout.map(|t| Instant::now() + t),
        });

        Ok(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        self.entries.get_mut(key).map(|e| &mut e.value)
    }

    /// Restarts the entry's expiry clock.
    pub fn touch(&mut self, key: usize) {
        let timeout = self.entry_timeout;

        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires = timeout.map(|t| Instant::now() + t);
        }
    }

    /// Deregisters and returns the entry.
    pub fn take(&mut self, key: usize) -> Option<T> {
        if !self.entries.contains(key) {
            return None;
        }

        let entry = self.entries.remove(key);

        let fd = entry.value.as_raw_fd();
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));

        Some(entry.value)
    }

    /// Polls for up to `timeout` and fills `out` with the ready entries.
    pub fn poll(
        &mut self,
        timeout: Duration,
        out: &mut Vec<(usize, Readiness)>,
    ) -> io::Result<()> {
        out.clear();

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let key = usize::from(event.token());

            if !self.entries.contains(key) {
                continue;
            }

            out.push((
                key,
                Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    hup: event.is_read_closed() || event.is_write_closed(),
                    error: event.is_error(),
                },
            ));
        }

        Ok(())
    }

    /// Removes and returns every entry whose expiry has passed.
    pub fn maintain(&mut self, now: Instant) -> Vec<T> {
        let expired: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires.map_or(false, |t| t <= now))
            .map(|(key, _)| key)
            .collect();

        expired.into_iter().filter_map(|key| self.take(key)).collect()
    }

    /// Removes and returns all entries.
    pub fn drain(&mut self) -> Vec<T> {
        let keys: Vec<usize> = self.entries.iter().map(|(key, _)| key).collect();

        keys.into_iter().filter_map(|key| self.take(key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        (server, client)
    }

    #[test]
    fn add_poll_take() {
        let mut set: PollSet<TcpStream> = PollSet::new(4, None).unwrap();
        let mut out = Vec::new();

        let (server, mut client) = pair();

        let key = set.add(server, Interest::READABLE).unwrap();
        assert_eq!(set.len(), 1);

        // nothing to read yet
        set.poll(Duration::from_millis(0), &mut out).unwrap();
        assert!(out.is_empty());

        client.write_all(b"x").unwrap();

        // wait for readability
        let deadline = Instant::now() + Duration::from_secs(5);
        while out.is_empty() && Instant::now() < deadline {
            set.poll(Duration::from_millis(100), &mut out).unwrap();
        }

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, key);
        assert!(out[0].1.readable);

        assert!(set.take(key).is_some());
        assert_eq!(set.len(), 0);
        assert!(set.take(key).is_none());
    }

    #[test]
    fn capacity_bound() {
        let mut set: PollSet<TcpStream> = PollSet::new(1, None).unwrap();

        let (server1, _client1) = pair();
        let (server2, _client2) = pair();

        set.add(server1, Interest::READABLE).unwrap();

        let (returned, e) = set.add(server2, Interest::READABLE).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::WriteZero);

        // the value comes back to the caller
        drop(returned);
    }

    #[test]
    fn maintain_expires_idle_entries() {
        let mut set: PollSet<TcpStream> =
            PollSet::new(4, Some(Duration::from_millis(20))).unwrap();

        let (server, _client) = pair();
        let key = set.add(server, Interest::READABLE).unwrap();

        // not expired yet
        assert!(set.maintain(Instant::now()).is_empty());

        thread::sleep(Duration::from_millis(40));

        let expired = set.maintain(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(set.len(), 0);
        assert!(set.get_mut(key).is_none());
    }

    #[test]
    fn touch_restarts_expiry() {
        let mut set: PollSet<TcpStream> =
            PollSet::new(4, Some(Duration::from_millis(40))).unwrap();

        let (server, _client) = pair();
        let key = set.add(server, Interest::READABLE).unwrap();

        thread::sleep(Duration::from_millis(25));
        set.touch(key);
        thread::sleep(Duration::from_millis(25));

        // without the touch this would have expired by now
        assert!(set.maintain(Instant::now()).is_empty());

        thread::sleep(Duration::from_millis(30));
        assert_eq!(set.maintain(Instant::now()).len(), 1);
    }

    #[test]
    fn drain_returns_everything() {
        let mut set: PollSet<TcpStream> = PollSet::new(4, None).unwrap();

        let (server1, _client1) = pair();
        let (server2, _client2) = pair();

        set.add(server1, Interest::READABLE).unwrap();
        set.add(server2, Interest::WRITABLE).unwrap();

        assert_eq!(set.drain().len(), 2);
        assert!(set.is_empty());
    }
}
