#![allow(clippy::mutex_atomic)] // needed for Condvar

use crate::types::*;
use log::trace;
use std::{
    collections::HashMap,
    sync::{Condvar, Mutex},
};

/// https://httpwg.org/specs/rfc7540.html#FlowControl
pub const MAX_WINDOW: i64 = (1 << 31) - 1;

#[derive(Debug, Clone, Copy)]
struct StreamWindows {
    /// What the peer still lets us send on this stream.
    remote: i64,
    /// What we still let the peer send on this stream.
    local: i64,
}

#[derive(Debug)]
struct FlowState {
    conn_remote: i64,
    conn_local: i64,
    /// Peer's INITIAL_WINDOW_SIZE; seeds new streams, and a SETTINGS change
    /// shifts every open stream by the delta.
    initial_remote: i64,
    /// Our announced INITIAL_WINDOW_SIZE, the per-stream refill target.
    /// SETTINGS never touches the connection scope; it refills to the fixed
    /// initial connection window.
    initial_local: i64,
    streams: HashMap<StreamId, StreamWindows>,
    failed: bool,
}

/// Connection- and stream-scope send/receive windows behind one lock, with a
/// condvar that wakes senders blocked on an exhausted window.
#[derive(Debug)]
pub struct FlowControl {
    state: Mutex<FlowState>,
    window_open: Condvar,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl {
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial_local(DEFAULT_WINDOW_SIZE)
    }

    /// `initial_local` is the receive window this side announces via
    /// SETTINGS; the refill logic targets it.
    #[must_use]
    pub fn with_initial_local(initial_local: u32) -> Self {
        Self {
            state: Mutex::new(FlowState {
                conn_remote: i64::from(DEFAULT_WINDOW_SIZE),
                conn_local: i64::from(DEFAULT_WINDOW_SIZE),
                initial_remote: i64::from(DEFAULT_WINDOW_SIZE),
                initial_local: i64::from(initial_local),
                streams: HashMap::new(),
                failed: false,
            }),
            window_open: Condvar::new(),
        }
    }

    pub fn register_stream(&self, id: StreamId) {
        let mut state = self.state.lock().expect("flow lock");
        let windows = StreamWindows {
            remote: state.initial_remote,
            local: state.initial_local,
        };
        state.streams.insert(id, windows);
    }

    /// Senders blocked on this stream's window observe the removal and
    /// fail out, so deregistering doubles as per-stream cancellation.
    pub fn deregister_stream(&self, id: StreamId) {
        let mut state = self.state.lock().expect("flow lock");
        state.streams.remove(&id);
        self.window_open.notify_all();
    }

    /// True iff `n` bytes fit in both the connection and the stream send
    /// window right now.
    #[must_use]
    pub fn can_send(&self, id: StreamId, n: usize) -> bool {
        let state = self.state.lock().expect("flow lock");
        let n = n as i64;
        n <= state.conn_remote
            && state
                .streams
                .get(&id)
                .map_or(false, |windows| n <= windows.remote)
    }

    /// Decrement both send windows by `n`. The caller must have checked
    /// `can_send` (or hold a `reserve` grant).
    pub fn consume_send(&self, id: StreamId, n: usize) {
        let mut state = self.state.lock().expect("flow lock");
        state.conn_remote -= n as i64;
        if let Some(windows) = state.streams.get_mut(&id) {
            windows.remote -= n as i64;
        }
    }

    /// Block until some send window is available at both scopes, then take
    /// up to `min(want, window, max_frame)` from both. The unblock signal is
    /// any WINDOW_UPDATE for either scope; connection failure wakes all
    /// blocked senders with an error.
    pub fn reserve(
        &self,
        id: StreamId,
        want: usize,
        max_frame: usize,
    ) -> Result<usize, TransportError> {
        let mut state = self.state.lock().expect("flow lock");
        loop {
            if state.failed {
                return Err(TransportError::ConnectionClosed);
            }
            let stream_remote = match state.streams.get(&id) {
                Some(windows) => windows.remote,
                None => return Err(TransportError::ConnectionClosed),
            };
            let available = state.conn_remote.min(stream_remote);
            if available > 0 {
                let granted = (want as i64).min(available).min(max_frame as i64);
                state.conn_remote -= granted;
                // unwrap: presence was checked above under the same lock
                state.streams.get_mut(&id).unwrap().remote -= granted;
                trace!("stream {} reserved {} of {} bytes", id, granted, want);
                return Ok(granted as usize);
            }
            state = self.window_open.wait(state).expect("flow wait");
        }
    }

    /// Account `n` received payload bytes against both receive windows.
    /// Returns the WINDOW_UPDATE frames to emit: once a scope drops below
    /// half its initial window it is restored to initial with one increment.
    /// An underflow means the peer overran the window.
    pub fn consume_recv(
        &self,
        id: StreamId,
        n: usize,
    ) -> Result<Vec<(StreamId, u32)>, TransportError> {
        let mut state = self.state.lock().expect("flow lock");
        let n = n as i64;
        if n > state.conn_local {
            return Err(TransportError::FlowWindow);
        }
        state.conn_local -= n;

        let mut updates = Vec::new();
        if state.conn_local < i64::from(DEFAULT_WINDOW_SIZE) / 2 {
            updates.push((0, (i64::from(DEFAULT_WINDOW_SIZE) - state.conn_local) as u32));
            state.conn_local = i64::from(DEFAULT_WINDOW_SIZE);
        }
        let initial_local = state.initial_local;
        if let Some(windows) = state.streams.get_mut(&id) {
            if n > windows.local {
                return Err(TransportError::FlowWindow);
            }
            windows.local -= n;
            if windows.local < initial_local / 2 {
                updates.push((id, (initial_local - windows.local) as u32));
                windows.local = initial_local;
            }
        }
        Ok(updates)
    }

    /// Apply a received WINDOW_UPDATE. `id == 0` addresses the connection
    /// scope. Increments past 2³¹−1 are a flow-control protocol error;
    /// updates for unknown (already closed) streams are ignored.
    pub fn receive_window_update(&self, id: StreamId, increment: u32) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("flow lock");
        if id == 0 {
            state.conn_remote += i64::from(increment);
            if state.conn_remote > MAX_WINDOW {
                return Err(TransportError::FlowWindow);
            }
        } else if let Some(windows) = state.streams.get_mut(&id) {
            windows.remote += i64::from(increment);
            if windows.remote > MAX_WINDOW {
                return Err(TransportError::FlowWindow);
            }
        }
        self.window_open.notify_all();
        Ok(())
    }

    /// SETTINGS INITIAL_WINDOW_SIZE changed: every open stream's send window
    /// shifts by the delta (possibly below zero), and new streams start at
    /// the new value.
    pub fn apply_initial_window(&self, new_initial: u32) -> Result<(), TransportError> {
        if i64::from(new_initial) > MAX_WINDOW {
            return Err(TransportError::FlowWindow);
        }
        let mut state = self.state.lock().expect("flow lock");
        let delta = i64::from(new_initial) - state.initial_remote;
        state.initial_remote = i64::from(new_initial);
        for windows in state.streams.values_mut() {
            windows.remote += delta;
            if windows.remote > MAX_WINDOW {
                return Err(TransportError::FlowWindow);
            }
        }
        if delta > 0 {
            self.window_open.notify_all();
        }
        Ok(())
    }

    /// Tear-down: wake every blocked sender with `ConnectionClosed`.
    pub fn fail(&self) {
        let mut state = self.state.lock().expect("flow lock");
        state.failed = true;
        self.window_open.notify_all();
    }

    #[must_use]
    pub fn connection_remote(&self) -> i64 {
        self.state.lock().expect("flow lock").conn_remote
    }

    #[must_use]
    pub fn stream_remote(&self, id: StreamId) -> Option<i64> {
        self.state
            .lock()
            .expect("flow lock")
            .streams
            .get(&id)
            .map(|windows| windows.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn can_send_needs_both_scopes() {
        let flow = FlowControl::new();
        flow.register_stream(1);
        assert!(flow.can_send(1, 65_535));
        assert!(!flow.can_send(1, 65_536));
        assert!(!flow.can_send(3, 1)); // unregistered stream

        flow.consume_send(1, 65_000);
        assert!(flow.can_send(1, 535));
        assert!(!flow.can_send(1, 536));
    }

    #[test]
    fn recv_window_refills_below_half() {
        let flow = FlowControl::new();
        flow.register_stream(1);

        // Stay above half: no updates yet.
        assert!(flow.consume_recv(1, 30_000).unwrap().is_empty());
        // Crossing half refills both scopes to initial.
        let updates = flow.consume_recv(1, 10_000).unwrap();
        assert_eq!(updates, vec![(0, 40_000), (1, 40_000)]);
        // Counters are restored, so the next small read is quiet again.
        assert!(flow.consume_recv(1, 100).unwrap().is_empty());
    }

    #[test]
    fn recv_underflow_is_rejected() {
        let flow = FlowControl::new();
        flow.register_stream(1);
        assert!(matches!(
            flow.consume_recv(1, 70_000),
            Err(TransportError::FlowWindow)
        ));
    }

    #[test]
    fn window_update_overflow_is_rejected() {
        let flow = FlowControl::new();
        flow.register_stream(1);
        assert!(flow.receive_window_update(0, 1).is_ok());
        assert!(matches!(
            flow.receive_window_update(0, MAX_WINDOW as u32),
            Err(TransportError::FlowWindow)
        ));
    }

    #[test]
    fn initial_window_delta_shifts_open_streams() {
        let flow = FlowControl::new();
        flow.register_stream(1);
        flow.apply_initial_window(10).unwrap();
        assert_eq!(flow.stream_remote(1), Some(10 - 65_535));
        // New streams start at the new initial.
        flow.register_stream(3);
        assert_eq!(flow.stream_remote(3), Some(10));
        // The connection window is not affected by SETTINGS.
        assert_eq!(flow.connection_remote(), 65_535);
    }

    #[test]
    fn reserve_blocks_until_window_update() {
        let flow = Arc::new(FlowControl::new());
        flow.register_stream(1);
        flow.apply_initial_window(10).unwrap();
        flow.register_stream(3);

        // First reservation takes the whole stream window.
        assert_eq!(flow.reserve(3, 25, 16_384).unwrap(), 10);

        let blocked = {
            let flow = flow.clone();
            thread::spawn(move || flow.reserve(3, 15, 16_384))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());

        flow.receive_window_update(3, 15).unwrap();
        assert_eq!(blocked.join().unwrap().unwrap(), 15);
    }

    #[test]
    fn reserve_fails_once_the_connection_does() {
        let flow = Arc::new(FlowControl::new());
        flow.register_stream(1);
        flow.consume_send(1, 65_535);

        let blocked = {
            let flow = flow.clone();
            thread::spawn(move || flow.reserve(1, 1, 16_384))
        };
        thread::sleep(Duration::from_millis(50));
        flow.fail();
        assert!(matches!(
            blocked.join().unwrap(),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn send_accounting_never_exceeds_initial_plus_updates() {
        let flow = FlowControl::new();
        flow.register_stream(1);
        let mut consumed: i64 = 0;
        let mut granted_updates: i64 = 0;
        // Stays under the initial window so no round ever blocks.
        for _ in 0..20 {
            let n = flow.reserve(1, 2_000, 16_384).unwrap();
            consumed += n as i64;
            assert!(consumed <= i64::from(DEFAULT_WINDOW_SIZE) + granted_updates);
            flow.receive_window_update(0, 1_000).unwrap();
            flow.receive_window_update(1, 1_000).unwrap();
            granted_updates += 1_000;
        }
    }
}
