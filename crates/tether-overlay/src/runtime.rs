//! Executes overlay commands on tokio.

use tokio::sync::mpsc;

use crate::{Cmd, Msg, OverlayEvent};

pub type MsgSender = mpsc::UnboundedSender<Msg>;
pub type MsgReceiver = mpsc::UnboundedReceiver<Msg>;

/// Runs [`Cmd`]s and funnels their resulting messages into one channel.
///
/// Timers and blocking session calls never run on the caller's task, so the
/// UI loop only ever waits on [`Dispatcher::recv`].
pub struct Dispatcher {
    tx: MsgSender,
    rx: MsgReceiver,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// A sender for injecting messages from elsewhere (e.g. an input thread).
    #[must_use]
    pub fn sender(&self) -> MsgSender {
        self.tx.clone()
    }

    /// Start everything `cmd` asks for and return the events it emitted.
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, cmd: Cmd) -> Vec<OverlayEvent> {
        let mut events = Vec::new();
        self.dispatch_into(cmd, &mut events);
        events
    }

    fn dispatch_into(&self, cmd: Cmd, events: &mut Vec<OverlayEvent>) {
        match cmd {
            Cmd::None => {}
            Cmd::Tick { delay, msg } => {
                let tx = self.tx.clone();
                if delay.is_zero() {
                    let _ = tx.send(msg);
                    return;
                }
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(msg);
                });
            }
            Cmd::Task(task) => {
                let tx = self.tx.clone();
                tokio::task::spawn_blocking(move || {
                    if let Some(msg) = task() {
                        let _ = tx.send(msg);
                    }
                });
            }
            Cmd::Emit(event) => events.push(event),
            Cmd::Batch(cmds) => {
                for cmd in cmds {
                    self.dispatch_into(cmd, events);
                }
            }
        }
    }

    /// Next message from a finished timer or task.
    pub async fn recv(&mut self) -> Option<Msg> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn next(dispatcher: &mut Dispatcher) -> Msg {
        tokio::time::timeout(Duration::from_secs(2), dispatcher.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_tick_delivers_after_delay() {
        let mut dispatcher = Dispatcher::new();
        let started = std::time::Instant::now();
        let events = dispatcher.dispatch(Cmd::Tick {
            delay: Duration::from_millis(30),
            msg: Msg::EscapeTimer,
        });
        assert!(events.is_empty());
        assert!(matches!(next(&mut dispatcher).await, Msg::EscapeTimer));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_task_result_is_delivered() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.dispatch(Cmd::task(|| Some(Msg::PollTick { generation: 7 })));
        assert!(matches!(next(&mut dispatcher).await, Msg::PollTick { generation: 7 }));
    }

    #[tokio::test]
    async fn test_batch_collects_events_and_runs_work() {
        let mut dispatcher = Dispatcher::new();
        let events = dispatcher.dispatch(Cmd::Batch(vec![
            Cmd::task(|| None),
            Cmd::Emit(OverlayEvent::AttachRequested),
            Cmd::Tick {
                delay: Duration::ZERO,
                msg: Msg::PaneResized,
            },
        ]));
        assert_eq!(events, vec![OverlayEvent::AttachRequested]);
        assert!(matches!(next(&mut dispatcher).await, Msg::PaneResized));
    }

    #[tokio::test]
    async fn test_external_sender_shares_channel() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.sender().send(Msg::Text("hi".into())).unwrap();
        assert!(matches!(next(&mut dispatcher).await, Msg::Text(text) if text == "hi"));
    }
}
