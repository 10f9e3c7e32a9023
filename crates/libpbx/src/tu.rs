use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use wire_protocol::Notification;

use crate::{Error, Result};

// The channel feeding a client's writer task. Notifications queued under the
// TU lock leave the socket in queue order, which keeps the lines a client
// sees ordered like the transitions on its TU.
pub type ClientTx = UnboundedSender<Notification>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TuState {
    #[default]
    OnHook,
    Ringing,
    DialTone,
    RingBack,
    BusySignal,
    Connected,
    Error,
}

impl TuState {
    pub fn name(&self) -> &'static str {
        match self {
            TuState::OnHook => "on hook",
            TuState::Ringing => "ringing",
            TuState::DialTone => "dial tone",
            TuState::RingBack => "ring back",
            TuState::BusySignal => "busy signal",
            TuState::Connected => "connected",
            TuState::Error => "error",
        }
    }
}

impl std::fmt::Display for TuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

struct TuInner {
    state: TuState,
    // Some iff state is Ringing, RingBack or Connected. The Arc clones held
    // here (one on each side of a pairing) are what keep a peer alive after
    // its registration is gone.
    peer: Option<Arc<TelephoneUnit>>,
}

/// One telephone line: the state machine behind a single connected client.
///
/// Constructed by the registry, which assigns the extension and the id. Two
/// TU locks are only ever taken in ascending id order; id is the total order
/// that makes the two-party transitions deadlock-free.
pub struct TelephoneUnit {
    id: u64,
    ext: u16,
    tx: ClientTx,
    inner: Mutex<TuInner>,
}

impl TelephoneUnit {
    pub(crate) fn new(id: u64, ext: u16, tx: ClientTx) -> Arc<Self> {
        Arc::new(Self {
            id,
            ext,
            tx,
            inner: Mutex::new(TuInner {
                state: TuState::OnHook,
                peer: None,
            }),
        })
    }

    pub fn ext(&self) -> u16 {
        self.ext
    }

    pub fn state(&self) -> TuState {
        self.inner.lock().state
    }

    // The initial ON HOOK line. The TU is not yet visible to any other task
    // when the registry calls this, so the state is known without the lock.
    pub(crate) fn notify_registered(&self) {
        let _ = self.tx.send(Notification::OnHook(self.ext));
    }

    fn notify(&self, inner: &TuInner) {
        let notification = match inner.state {
            TuState::OnHook => Notification::OnHook(self.ext),
            TuState::Ringing => Notification::Ringing,
            TuState::DialTone => Notification::DialTone,
            TuState::RingBack => Notification::RingBack,
            TuState::BusySignal => Notification::BusySignal,
            TuState::Connected => match &inner.peer {
                Some(peer) => Notification::Connected(peer.ext),
                None => unreachable!("connected without a peer"),
            },
            TuState::Error => Notification::Error,
        };
        // The writer may already be gone; its session will clean up.
        let _ = self.tx.send(notification);
    }

    // Locks both TUs, lower id first. Guards come back in (a, b) order
    // regardless of which was locked first.
    fn lock_both<'a>(
        a: &'a Self,
        b: &'a Self,
    ) -> (MutexGuard<'a, TuInner>, MutexGuard<'a, TuInner>) {
        debug_assert_ne!(a.id, b.id);
        if a.id < b.id {
            let ga = a.inner.lock();
            let gb = b.inner.lock();
            (ga, gb)
        } else {
            let gb = b.inner.lock();
            let ga = a.inner.lock();
            (ga, gb)
        }
    }

    fn is_peered_with(inner: &TuInner, other: &Arc<TelephoneUnit>) -> bool {
        inner.peer.as_ref().is_some_and(|p| Arc::ptr_eq(p, other))
    }

    /// Lift the receiver. On hook this opens a dial tone; while ringing it
    /// answers the incoming call and connects both parties. In any other
    /// state the current state is re-notified and nothing moves.
    pub fn pickup(self: &Arc<Self>) {
        loop {
            let peer = {
                let mut inner = self.inner.lock();
                match inner.state {
                    TuState::OnHook => {
                        inner.state = TuState::DialTone;
                        self.notify(&inner);
                        return;
                    }
                    TuState::Ringing => match inner.peer.clone() {
                        Some(peer) => peer,
                        None => unreachable!("ringing without a peer"),
                    },
                    _ => {
                        self.notify(&inner);
                        return;
                    }
                }
            };

            // The peer was discovered under our own lock only; re-acquire in
            // id order and make sure the call is still the one we saw.
            let (mut me, mut other) = Self::lock_both(self, &peer);
            if me.state != TuState::Ringing || !Self::is_peered_with(&me, &peer) {
                continue;
            }
            me.state = TuState::Connected;
            other.state = TuState::Connected;
            self.notify(&me);
            peer.notify(&other);
            return;
        }
    }

    /// Put the receiver down. Dissolves any pairing: an answered call leaves
    /// the peer with a dial tone, an unanswered one (from either side) puts
    /// the peer back on hook.
    pub fn hangup(self: &Arc<Self>) {
        loop {
            let peer = {
                let mut inner = self.inner.lock();
                match inner.peer.clone() {
                    Some(peer) => peer,
                    None => {
                        // DialTone, BusySignal and Error all drop back on
                        // hook; OnHook stays put. The client hears the
                        // resulting state either way.
                        inner.state = TuState::OnHook;
                        self.notify(&inner);
                        return;
                    }
                }
            };

            let (mut me, mut other) = Self::lock_both(self, &peer);
            if !Self::is_peered_with(&me, &peer) {
                continue;
            }
            match me.state {
                TuState::Connected => other.state = TuState::DialTone,
                TuState::Ringing | TuState::RingBack => other.state = TuState::OnHook,
                state => unreachable!("peered in state {state}"),
            }
            me.state = TuState::OnHook;
            // Notify before the link is torn down so each client sees its
            // final state.
            self.notify(&me);
            peer.notify(&other);
            me.peer = None;
            other.peer = None;
            return;
        }
    }

    /// Call another TU. Only meaningful with a dial tone; `target` is the
    /// registry's resolution of the dialed extension, `None` when it was
    /// invalid or vacant.
    pub fn dial(self: &Arc<Self>, target: Option<Arc<Self>>) {
        let target = match target {
            Some(target) if !Arc::ptr_eq(self, &target) => target,
            other => {
                // A null target or dialing yourself never needs the second
                // lock.
                let mut inner = self.inner.lock();
                if inner.state == TuState::DialTone {
                    inner.state = match other {
                        Some(_) => TuState::BusySignal,
                        None => TuState::Error,
                    };
                }
                self.notify(&inner);
                return;
            }
        };

        // First a peek with just our own lock; the second lock can only be
        // taken in id order, so the authoritative check repeats below with
        // both locks held.
        {
            let inner = self.inner.lock();
            if inner.state != TuState::DialTone {
                self.notify(&inner);
                return;
            }
        }

        let (mut me, mut other) = Self::lock_both(self, &target);
        if me.state != TuState::DialTone {
            // Something moved us between the two acquisitions.
            self.notify(&me);
            return;
        }
        if other.state != TuState::OnHook || other.peer.is_some() {
            me.state = TuState::BusySignal;
            self.notify(&me);
            return;
        }
        me.state = TuState::RingBack;
        other.state = TuState::Ringing;
        me.peer = Some(target.clone());
        other.peer = Some(self.clone());
        self.notify(&me);
        target.notify(&other);
    }

    /// Relay a chat line to the connected peer and confirm our own state.
    /// Fails without touching any state when not connected, or when the
    /// peer's client has gone away.
    pub fn chat(self: &Arc<Self>, text: &str) -> Result<()> {
        loop {
            let peer = {
                let inner = self.inner.lock();
                if inner.state != TuState::Connected {
                    self.notify(&inner);
                    return Err(Error::NotConnected);
                }
                match inner.peer.clone() {
                    Some(peer) => peer,
                    None => unreachable!("connected without a peer"),
                }
            };

            let (me, _other) = Self::lock_both(self, &peer);
            if me.state != TuState::Connected || !Self::is_peered_with(&me, &peer) {
                continue;
            }
            // Both locks held: the pairing cannot move while the lines are
            // queued, keeping the CHAT ordered with any transition on either
            // side.
            let sent = peer.tx.send(Notification::Chat(text.to_owned()));
            self.notify(&me);
            return sent.map_err(|_| Error::ClientGone);
        }
    }
}

#[cfg(test)]
impl TelephoneUnit {
    fn peer(&self) -> Option<Arc<TelephoneUnit>> {
        self.inner.lock().peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    use super::*;

    type Rx = UnboundedReceiver<Notification>;

    fn make_tu(id: u64, ext: u16) -> (Arc<TelephoneUnit>, Rx) {
        let (tx, rx) = unbounded_channel();
        (TelephoneUnit::new(id, ext, tx), rx)
    }

    fn drain(rx: &mut Rx) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    // Ring a up and dial b, leaving a in RingBack and b in Ringing. Queued
    // notifications are drained.
    fn ring(a: &Arc<TelephoneUnit>, arx: &mut Rx, b: &Arc<TelephoneUnit>, brx: &mut Rx) {
        a.pickup();
        a.dial(Some(b.clone()));
        assert_eq!(a.state(), TuState::RingBack);
        assert_eq!(b.state(), TuState::Ringing);
        drain(arx);
        drain(brx);
    }

    fn connect(a: &Arc<TelephoneUnit>, arx: &mut Rx, b: &Arc<TelephoneUnit>, brx: &mut Rx) {
        ring(a, arx, b, brx);
        b.pickup();
        drain(arx);
        drain(brx);
    }

    fn assert_paired(a: &Arc<TelephoneUnit>, b: &Arc<TelephoneUnit>) {
        let a_peer = a.peer().expect("a must have a peer");
        let b_peer = b.peer().expect("b must have a peer");
        assert!(Arc::ptr_eq(&a_peer, b));
        assert!(Arc::ptr_eq(&b_peer, a));
        let states = (a.state(), b.state());
        assert!(
            matches!(
                states,
                (TuState::RingBack, TuState::Ringing)
                    | (TuState::Ringing, TuState::RingBack)
                    | (TuState::Connected, TuState::Connected)
            ),
            "unexpected paired states {states:?}"
        );
    }

    fn assert_unpaired(tu: &Arc<TelephoneUnit>) {
        assert!(tu.peer().is_none());
        assert!(!matches!(
            tu.state(),
            TuState::Ringing | TuState::RingBack | TuState::Connected
        ));
    }

    #[test]
    fn test_pickup_twice_is_idempotent() {
        let (a, mut arx) = make_tu(0, 0);
        a.pickup();
        a.pickup();
        assert_eq!(a.state(), TuState::DialTone);
        assert_eq!(
            drain(&mut arx),
            vec![Notification::DialTone, Notification::DialTone]
        );
    }

    #[test]
    fn test_dial_null_target() {
        let (a, mut arx) = make_tu(0, 0);
        a.pickup();
        a.dial(None);
        assert_eq!(a.state(), TuState::Error);
        assert_eq!(
            drain(&mut arx),
            vec![Notification::DialTone, Notification::Error]
        );
        // Hangup recovers from the error state.
        a.hangup();
        assert_eq!(a.state(), TuState::OnHook);
        assert_eq!(drain(&mut arx), vec![Notification::OnHook(0)]);
    }

    #[test]
    fn test_dial_self_is_busy() {
        let (a, mut arx) = make_tu(0, 0);
        a.pickup();
        a.dial(Some(a.clone()));
        assert_eq!(a.state(), TuState::BusySignal);
        assert_eq!(
            drain(&mut arx),
            vec![Notification::DialTone, Notification::BusySignal]
        );
    }

    #[test]
    fn test_dial_without_dial_tone_renotifies() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, _brx) = make_tu(1, 1);
        a.dial(Some(b.clone()));
        assert_eq!(a.state(), TuState::OnHook);
        assert_eq!(b.state(), TuState::OnHook);
        assert_eq!(drain(&mut arx), vec![Notification::OnHook(0)]);
    }

    #[test]
    fn test_dial_busy_target() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, mut brx) = make_tu(1, 1);
        b.pickup();
        a.pickup();
        a.dial(Some(b.clone()));
        assert_eq!(a.state(), TuState::BusySignal);
        assert_eq!(b.state(), TuState::DialTone);
        assert_eq!(
            drain(&mut arx),
            vec![Notification::DialTone, Notification::BusySignal]
        );
        // The target never hears anything about the failed attempt.
        assert_eq!(drain(&mut brx), vec![Notification::DialTone]);
    }

    #[test]
    fn test_dial_ringing_target_is_busy() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, mut brx) = make_tu(1, 1);
        let (c, mut crx) = make_tu(2, 2);
        ring(&a, &mut arx, &b, &mut brx);
        c.pickup();
        c.dial(Some(b.clone()));
        assert_eq!(c.state(), TuState::BusySignal);
        assert_eq!(
            drain(&mut crx),
            vec![Notification::DialTone, Notification::BusySignal]
        );
        assert_paired(&a, &b);
    }

    #[test]
    fn test_call_setup_and_notifications() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, mut brx) = make_tu(1, 1);
        a.pickup();
        a.dial(Some(b.clone()));
        assert_paired(&a, &b);
        assert_eq!(
            drain(&mut arx),
            vec![Notification::DialTone, Notification::RingBack]
        );
        assert_eq!(drain(&mut brx), vec![Notification::Ringing]);

        b.pickup();
        assert_eq!(a.state(), TuState::Connected);
        assert_eq!(b.state(), TuState::Connected);
        assert_paired(&a, &b);
        assert_eq!(drain(&mut arx), vec![Notification::Connected(1)]);
        assert_eq!(drain(&mut brx), vec![Notification::Connected(0)]);
    }

    #[test]
    fn test_chat_relays_to_peer() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, mut brx) = make_tu(1, 1);
        connect(&a, &mut arx, &b, &mut brx);

        a.chat("hello").unwrap();
        assert_eq!(drain(&mut brx), vec![Notification::Chat("hello".to_owned())]);
        assert_eq!(drain(&mut arx), vec![Notification::Connected(1)]);
        // States are untouched by chat.
        assert_paired(&a, &b);
    }

    #[test]
    fn test_chat_requires_connection() {
        let (a, mut arx) = make_tu(0, 0);
        a.pickup();
        drain(&mut arx);
        assert!(matches!(a.chat("hi"), Err(Error::NotConnected)));
        assert_eq!(a.state(), TuState::DialTone);
        assert_eq!(drain(&mut arx), vec![Notification::DialTone]);
    }

    #[test]
    fn test_chat_to_gone_client() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, brx) = make_tu(1, 1);
        let mut brx = brx;
        connect(&a, &mut arx, &b, &mut brx);
        drop(brx);
        assert!(matches!(a.chat("anyone there"), Err(Error::ClientGone)));
        // The pairing itself is unaffected; teardown is the session's job.
        assert_eq!(a.state(), TuState::Connected);
        assert_eq!(b.state(), TuState::Connected);
    }

    #[test]
    fn test_hangup_connected_call() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, mut brx) = make_tu(1, 1);
        connect(&a, &mut arx, &b, &mut brx);

        b.hangup();
        assert_eq!(b.state(), TuState::OnHook);
        assert_eq!(a.state(), TuState::DialTone);
        assert_unpaired(&a);
        assert_unpaired(&b);
        assert_eq!(drain(&mut brx), vec![Notification::OnHook(1)]);
        assert_eq!(drain(&mut arx), vec![Notification::DialTone]);
    }

    #[test]
    fn test_caller_abandons_unanswered_call() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, mut brx) = make_tu(1, 1);
        ring(&a, &mut arx, &b, &mut brx);

        a.hangup();
        assert_eq!(a.state(), TuState::OnHook);
        assert_eq!(b.state(), TuState::OnHook);
        assert_unpaired(&a);
        assert_unpaired(&b);
        assert_eq!(drain(&mut arx), vec![Notification::OnHook(0)]);
        assert_eq!(drain(&mut brx), vec![Notification::OnHook(1)]);
    }

    #[test]
    fn test_callee_rejects_unanswered_call() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, mut brx) = make_tu(1, 1);
        ring(&a, &mut arx, &b, &mut brx);

        b.hangup();
        assert_eq!(a.state(), TuState::OnHook);
        assert_eq!(b.state(), TuState::OnHook);
        assert_unpaired(&a);
        assert_unpaired(&b);
    }

    #[test]
    fn test_pairing_holds_a_reference() {
        let (a, mut arx) = make_tu(0, 0);
        let (b, mut brx) = make_tu(1, 1);
        assert_eq!(Arc::strong_count(&a), 1);
        connect(&a, &mut arx, &b, &mut brx);
        // One clone held by the peer link on each side.
        assert_eq!(Arc::strong_count(&a), 2);
        assert_eq!(Arc::strong_count(&b), 2);
        a.hangup();
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(Arc::strong_count(&b), 1);
    }

    // Both parties already have a dial tone, so each dial finds the other
    // off hook: both must come back busy and no pairing may form, no matter
    // how the two dials interleave.
    #[test]
    fn test_cross_dial_both_off_hook_is_busy() {
        for round in 0..200 {
            let (a, mut arx) = make_tu(round * 2, 0);
            let (b, mut brx) = make_tu(round * 2 + 1, 1);
            a.pickup();
            b.pickup();
            drain(&mut arx);
            drain(&mut brx);

            let (a2, b2) = (a.clone(), b.clone());
            let (a3, b3) = (a.clone(), b.clone());
            let t1 = std::thread::spawn(move || a2.dial(Some(b2)));
            let t2 = std::thread::spawn(move || b3.dial(Some(a3)));
            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(a.state(), TuState::BusySignal, "round {round}");
            assert_eq!(b.state(), TuState::BusySignal, "round {round}");
            assert!(a.peer().is_none());
            assert!(b.peer().is_none());
            assert_eq!(drain(&mut arx), vec![Notification::BusySignal]);
            assert_eq!(drain(&mut brx), vec![Notification::BusySignal]);
        }
    }

    // Racing pickup-then-dial on both sides leaves a window where one dial
    // can still catch the other party on hook. At most one pairing may ever
    // form; when one does, the loser's own pickup answers it.
    #[test]
    fn test_cross_dial_race_forms_at_most_one_call() {
        for round in 0..200 {
            let (a, mut arx) = make_tu(round * 2, 0);
            let (b, mut brx) = make_tu(round * 2 + 1, 1);

            let (a2, b2) = (a.clone(), b.clone());
            let (a3, b3) = (a.clone(), b.clone());
            let t1 = std::thread::spawn(move || {
                a2.pickup();
                a2.dial(Some(b2));
            });
            let t2 = std::thread::spawn(move || {
                b3.pickup();
                b3.dial(Some(a3));
            });
            t1.join().unwrap();
            t2.join().unwrap();

            let a_seen = drain(&mut arx);
            let b_seen = drain(&mut brx);
            let a_won = a_seen.contains(&Notification::RingBack);
            let b_won = b_seen.contains(&Notification::RingBack);
            assert!(
                !(a_won && b_won),
                "round {round}: both dials claimed a pairing"
            );

            if a_won || b_won {
                // One dial found its target still on hook and rang it; the
                // loser's pickup then answered the call, and its dial was a
                // no-op re-notify.
                assert_eq!(a.state(), TuState::Connected, "round {round}");
                assert_eq!(b.state(), TuState::Connected, "round {round}");
                assert_paired(&a, &b);
                let loser_seen = if a_won { &b_seen } else { &a_seen };
                assert!(
                    loser_seen.contains(&Notification::Ringing),
                    "round {round}: loser never rang: {loser_seen:?}"
                );
            } else {
                // Both pickups beat both dials; each dial found the other
                // side off hook.
                assert_eq!(a.state(), TuState::BusySignal, "round {round}");
                assert_eq!(b.state(), TuState::BusySignal, "round {round}");
                assert!(a.peer().is_none());
                assert!(b.peer().is_none());
                assert!(a_seen.contains(&Notification::BusySignal));
                assert!(b_seen.contains(&Notification::BusySignal));
            }
        }
    }
}
