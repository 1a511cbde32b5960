//! Delivery of state notifications off the stage workers.
//!
//! Every notification goes through one dispatcher thread, which runs the
//! registered callback and feeds `subscribe()` channels in posting order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use stream_player_types::PlayerState;

pub type Callback = Arc<dyn Fn(&PlayerState) + Send + Sync + 'static>;

#[derive(Default)]
struct Targets {
    callback: Option<Callback>,
    subscribers: Vec<Sender<PlayerState>>,
}

pub(crate) struct Notifier {
    tx: Option<Sender<PlayerState>>,
    targets: Arc<Mutex<Targets>>,
    thread: Option<JoinHandle<()>>,
}

fn lock(targets: &Mutex<Targets>) -> MutexGuard<'_, Targets> {
    targets.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Notifier {
    pub(crate) fn start() -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<PlayerState>();
        let targets = Arc::new(Mutex::new(Targets::default()));
        let targets_thread = targets.clone();
        let thread = thread::Builder::new()
            .name("player-notify".to_string())
            .spawn(move || {
                for state in rx.iter() {
                    // Targets are snapshotted so a callback may re-enter the notifier.
                    let (callback, subscribers) = {
                        let g = lock(&targets_thread);
                        (g.callback.clone(), g.subscribers.clone())
                    };
                    if let Some(cb) = callback {
                        cb(&state);
                    }
                    let dead: Vec<_> = subscribers
                        .into_iter()
                        .filter(|s| s.send(state.clone()).is_err())
                        .collect();
                    if !dead.is_empty() {
                        lock(&targets_thread)
                            .subscribers
                            .retain(|s| !dead.iter().any(|d| d.same_channel(s)));
                    }
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            targets,
            thread: Some(thread),
        })
    }

    /// Queue `state` for delivery.
    pub(crate) fn post(&self, state: PlayerState) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(state);
        }
    }

    pub(crate) fn set_callback(&self, callback: Option<Callback>) {
        lock(&self.targets).callback = callback;
    }

    pub(crate) fn subscribe(&self) -> Receiver<PlayerState> {
        let (tx, rx) = unbounded();
        lock(&self.targets).subscribers.push(tx);
        rx
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // Closing the channel lets the dispatcher deliver what is queued and exit.
        self.tx = None;
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stream_player_types::PlaybackStatus;

    fn state(status: PlaybackStatus) -> PlayerState {
        PlayerState {
            status,
            ..PlayerState::default()
        }
    }

    #[test]
    fn callback_and_subscribers_see_posting_order() {
        let notifier = Notifier::start().unwrap();
        let (tx, rx) = unbounded();
        notifier.set_callback(Some(Arc::new(move |s: &PlayerState| {
            let _ = tx.send((thread::current().name().map(str::to_string), s.status));
        })));
        let sub = notifier.subscribe();

        notifier.post(state(PlaybackStatus::Running));
        notifier.post(state(PlaybackStatus::Finished));

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, (Some("player-notify".to_string()), PlaybackStatus::Running));
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(second.1, PlaybackStatus::Finished);

        let seen: Vec<_> = (0..2)
            .map(|_| sub.recv_timeout(Duration::from_secs(1)).unwrap().status)
            .collect();
        assert_eq!(seen, vec![PlaybackStatus::Running, PlaybackStatus::Finished]);
    }

    #[test]
    fn callback_may_subscribe_from_inside_itself() {
        let notifier = Arc::new(Notifier::start().unwrap());
        let (tx, rx) = unbounded();
        let weak = Arc::downgrade(&notifier);
        notifier.set_callback(Some(Arc::new(move |s: &PlayerState| {
            if let Some(n) = weak.upgrade() {
                let _ = tx.send((s.status, n.subscribe()));
            }
        })));

        notifier.post(state(PlaybackStatus::Running));
        let (first, inner_sub) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, PlaybackStatus::Running);

        notifier.post(state(PlaybackStatus::Finished));
        let (second, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(second, PlaybackStatus::Finished);
        assert_eq!(
            inner_sub.recv_timeout(Duration::from_secs(2)).unwrap().status,
            PlaybackStatus::Finished
        );
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let notifier = Notifier::start().unwrap();
        drop(notifier.subscribe());
        let live = notifier.subscribe();
        notifier.post(state(PlaybackStatus::Running));
        assert_eq!(
            live.recv_timeout(Duration::from_secs(1)).unwrap().status,
            PlaybackStatus::Running
        );
        notifier.post(state(PlaybackStatus::Finished));
        assert_eq!(
            live.recv_timeout(Duration::from_secs(1)).unwrap().status,
            PlaybackStatus::Finished
        );
        assert_eq!(lock(&notifier.targets).subscribers.len(), 1);
        drop(notifier);
    }
}
