use std::{sync::Arc, time::Duration};

use futures_lite::future;

use crate::{
    logging::{trace, warning},
    protocol::Outgoing,
    Error,
};

use super::{
    manager::ConnectionManager,
    send_queue::{Delivery, SendQueue},
};

#[derive(Clone, Debug)]
pub(super) struct KeepAliveSettings {
    /// How often to send a keep alive ping
    pub(super) interval: Option<Duration>,

    /// How many pings can be sent without receiving a reply before
    /// the connection is considered dropped
    pub(super) retries: usize,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            interval: None,
            retries: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeepAliveState {
    Running,
    StartedKeepAlive,
    TimingOut { failure_count: usize },
}

/// What the keep alive timer should do after an interval of silence.
#[derive(Debug, PartialEq, Eq)]
enum Action {
    Ping,
    GiveUp,
}

enum Tick {
    Traffic,
    Silence,
    Closed,
}

impl KeepAliveSettings {
    /// Pings the server whenever the connection has been silent for an interval,
    /// and resets the connection once too many intervals pass without traffic.
    ///
    /// Any incoming message counts as traffic, including legacy `ka` messages.
    pub(super) async fn run(self, manager: Arc<ConnectionManager>, queue: SendQueue) {
        let Some(interval) = self.interval else {
            return;
        };

        let traffic = manager.incoming().subscribe_all();
        let mut state = KeepAliveState::Running;
        let mut watching = None;

        loop {
            let tick = future::or(
                async {
                    match traffic.recv().await {
                        Ok(_) => Tick::Traffic,
                        Err(_) => Tick::Closed,
                    }
                },
                async {
                    futures_timer::Delay::new(interval).await;
                    Tick::Silence
                },
            )
            .await;

            match tick {
                Tick::Closed => return,
                Tick::Traffic => state = KeepAliveState::Running,
                Tick::Silence => {
                    let Some(generation) = manager.current_generation() else {
                        state = KeepAliveState::Running;
                        continue;
                    };
                    if watching != Some(generation) {
                        watching = Some(generation);
                        state = KeepAliveState::Running;
                    }

                    match state.silence(self.retries) {
                        (next, Action::Ping) => {
                            state = next;
                            trace!("sending keep alive ping");
                            drop(queue.enqueue(Outgoing::Ping(None), Delivery::IfConnected));
                        }
                        (_, Action::GiveUp) => {
                            warning!(
                                "no messages received in {} keep alive intervals",
                                self.retries + 2
                            );
                            state = KeepAliveState::Running;
                            queue.reset(
                                generation,
                                Error::Timeout("keep alive pings went unanswered".into()),
                            );
                        }
                    }
                }
            }
        }
    }
}

impl KeepAliveState {
    fn silence(self, retries: usize) -> (Self, Action) {
        let next = match self {
            KeepAliveState::Running => KeepAliveState::StartedKeepAlive,
            KeepAliveState::StartedKeepAlive => KeepAliveState::TimingOut { failure_count: 0 },
            KeepAliveState::TimingOut { failure_count } => KeepAliveState::TimingOut {
                failure_count: failure_count + 1,
            },
        };

        if next.failure_count() > retries {
            return (next, Action::GiveUp);
        }

        (next, Action::Ping)
    }

    fn failure_count(&self) -> usize {
        match self {
            KeepAliveState::Running | KeepAliveState::StartedKeepAlive => 0,
            KeepAliveState::TimingOut { failure_count } => *failure_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gives_up_after_retries_are_exhausted() {
        let mut state = KeepAliveState::Running;
        let mut actions = vec![];
        for _ in 0..6 {
            let (next, action) = state.silence(3);
            state = next;
            actions.push(action);
        }

        assert_eq!(
            actions,
            vec![
                Action::Ping,
                Action::Ping,
                Action::Ping,
                Action::Ping,
                Action::Ping,
                Action::GiveUp
            ]
        );
    }

    #[test]
    fn zero_retries_gives_up_quickly() {
        let (state, first) = KeepAliveState::Running.silence(0);
        let (state, second) = state.silence(0);
        let (_, third) = state.silence(0);

        assert_eq!(first, Action::Ping);
        assert_eq!(second, Action::Ping);
        assert_eq!(third, Action::GiveUp);
    }
}
