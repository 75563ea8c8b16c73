/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Delivery of client events to user code.

Events are produced wherever the client is serviced.  In `Marshalled` mode they are queued and
only run when the owner of the [`EventPump`] pumps it, on whatever thread that is, in the order
they were produced.  In `Direct` mode handlers run immediately on the servicing thread.  Direct
handlers must not call back into the client they were invoked by.
 */

use crate::client::{ClientEvent, ClientEventListener};
use crate::error::{MqttifyError, MqttifyResult};
use crate::subscription::MessageHandler;

use log::*;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

/// Selects the thread that user event handlers run on
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DispatchMode {

    /// Events are queued until an [`EventPump`] is pumped, preserving arrival order
    #[default]
    Marshalled,

    /// Handlers run on the thread servicing the client, as soon as the event occurs
    Direct,
}

/// One event plus every callback that should see it
pub(crate) struct DispatchItem {
    pub(crate) event: Arc<ClientEvent>,
    pub(crate) listeners: Vec<ClientEventListener>,
    pub(crate) message_handlers: Vec<MessageHandler>,
}

impl DispatchItem {
    fn deliver(self) {
        if let ClientEvent::MessageReceived(message) = self.event.as_ref() {
            for handler in &self.message_handlers {
                handler(message);
            }
        }

        for listener in &self.listeners {
            listener(self.event.clone());
        }
    }
}

#[derive(Clone)]
pub(crate) enum Dispatcher {
    Direct,
    Marshalled(mpsc::Sender<DispatchItem>),
}

impl Dispatcher {

    /// Creates a dispatcher for a mode.  Marshalled dispatchers come with the pump that drains
    /// them.
    pub(crate) fn new(mode: DispatchMode) -> (Dispatcher, Option<EventPump>) {
        match mode {
            DispatchMode::Direct => { (Dispatcher::Direct, None) }
            DispatchMode::Marshalled => {
                let (sender, receiver) = mpsc::channel();
                (Dispatcher::Marshalled(sender), Some(EventPump { receiver }))
            }
        }
    }

    pub(crate) fn dispatch(&self, item: DispatchItem) {
        match self {
            Dispatcher::Direct => { item.deliver(); }
            Dispatcher::Marshalled(sender) => {
                if sender.send(item).is_err() {
                    // nobody holds the pump anymore
                    debug!("Dispatcher - event dropped, event pump has been released");
                }
            }
        }
    }
}

/// Runs marshalled events on the thread that calls it.
pub struct EventPump {
    receiver: mpsc::Receiver<DispatchItem>,
}

impl EventPump {

    /// Delivers every queued event without blocking.  Returns the number of events delivered.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        while let Ok(item) = self.receiver.try_recv() {
            item.deliver();
            delivered += 1;
        }

        delivered
    }

    /// Waits up to `timeout` for the first event, then delivers everything queued.
    ///
    /// Fails with `OperationChannelFailure` once every client feeding this pump is gone.
    pub fn pump_timeout(&self, timeout: Duration) -> MqttifyResult<usize> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => {
                item.deliver();
                Ok(1 + self.pump())
            }
            Err(mpsc::RecvTimeoutError::Timeout) => { Ok(0) }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(MqttifyError::new_operation_channel_failure("every event source for this pump has been dropped"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::*;
    use crate::mqtt::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    fn message_item(topic: &str, log: &Arc<Mutex<Vec<String>>>) -> DispatchItem {
        let handler_log = log.clone();
        let handler : MessageHandler = Arc::new(move |event: &MessageReceivedEvent| {
            handler_log.lock().unwrap().push(format!("handler {}", event.publish.topic));
        });

        let listener_log = log.clone();
        let listener : ClientEventListener = Arc::new(move |event: Arc<ClientEvent>| {
            if let ClientEvent::MessageReceived(message) = event.as_ref() {
                listener_log.lock().unwrap().push(format!("listener {}", message.publish.topic));
            }
        });

        DispatchItem {
            event: Arc::new(ClientEvent::MessageReceived(MessageReceivedEvent {
                publish: PublishPacket::new(topic, &[], QualityOfService::AtMostOnce, false),
            })),
            listeners: vec!(listener),
            message_handlers: vec!(handler),
        }
    }

    #[test]
    fn direct_mode_delivers_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (dispatcher, pump) = Dispatcher::new(DispatchMode::Direct);
        assert!(pump.is_none());

        dispatcher.dispatch(message_item("a", &log));
        assert_eq!(vec!("handler a".to_string(), "listener a".to_string()), *log.lock().unwrap());
    }

    #[test]
    fn marshalled_mode_waits_for_pump_and_keeps_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (dispatcher, pump) = Dispatcher::new(DispatchMode::Marshalled);
        let pump = pump.unwrap();

        dispatcher.dispatch(message_item("a", &log));
        dispatcher.dispatch(message_item("b", &log));
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(2, pump.pump());
        assert_eq!(vec!("handler a", "listener a", "handler b", "listener b"), *log.lock().unwrap());
        assert_eq!(0, pump.pump());
    }

    #[test]
    fn marshalled_across_threads() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (dispatcher, pump) = Dispatcher::new(DispatchMode::Marshalled);
        let pump = pump.unwrap();

        let worker_log = log.clone();
        std::thread::spawn(move || {
            dispatcher.dispatch(message_item("x", &worker_log));
        }).join().unwrap();

        assert_eq!(1, pump.pump_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(2, log.lock().unwrap().len());

        // the only sender went away with the worker thread
        assert_matches!(pump.pump_timeout(Duration::from_millis(10)), Err(MqttifyError::OperationChannelFailure(_)));
    }
}
