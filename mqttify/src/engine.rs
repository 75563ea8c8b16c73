/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A process-level container for clients.

An [`EngineInstance`] owns a time base shared by all of its clients, a pool that hands out one
client per distinct [`ConnectionSettings`], and one marshalled event queue that every
`Marshalled`-mode client in the pool feeds.  Hosts either call [`EngineInstance::tick`] from
their own loop or let a [`WorkerHandle`] do it on a background thread.
 */

use crate::client::{ClientContext, MqttClient};
use crate::config::*;
use crate::dispatch::*;
use crate::error::{fold_mqtt_result, MqttifyError, MqttifyResult};
use crate::protocol::fold_optional_timepoint_min;
use crate::transport::TransportAdapter;

use log::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A pooled client.  Lock it to submit operations; the engine locks it to service it.
pub type SharedClient = Arc<Mutex<MqttClient>>;

struct PoolEntry {
    client: SharedClient,
    references: usize,
}

struct EngineState {
    base_timestamp: Instant,
    next_instance_id: AtomicU64,
    pool: Mutex<HashMap<u64, PoolEntry>>,
    dispatcher: Dispatcher,
    event_pump: Mutex<Option<EventPump>>,
}

/// Shared handle to a client pool.  Clones refer to the same engine.
#[derive(Clone)]
pub struct EngineInstance {
    state: Arc<EngineState>,
}

impl Default for EngineInstance {
    fn default() -> Self {
        EngineInstance::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EngineInstance {

    pub fn new() -> Self {
        let (dispatcher, event_pump) = Dispatcher::new(DispatchMode::Marshalled);

        EngineInstance {
            state: Arc::new(EngineState {
                base_timestamp: Instant::now(),
                next_instance_id: AtomicU64::new(1),
                pool: Mutex::new(HashMap::new()),
                dispatcher,
                event_pump: Mutex::new(event_pump),
            })
        }
    }

    /// Time base every pooled client measures from
    pub fn base_timestamp(&self) -> Instant {
        self.state.base_timestamp
    }

    /// Hands out the pump for events from every `Marshalled`-mode client in the pool.  Only
    /// the first call returns one.
    pub fn take_event_pump(&self) -> Option<EventPump> {
        lock(&self.state.event_pump).take()
    }

    /// Returns the pooled client for these settings, creating it if needed.
    ///
    /// The options and transport factory are only used when a new client is created.  Every
    /// successful call must be balanced by a [`EngineInstance::release_client`].
    pub fn get_or_create_client<F>(&self, settings: &ConnectionSettings, connect_options: ConnectOptions, client_options: ClientOptions, transport_factory: F) -> SharedClient
        where F: FnOnce() -> Box<dyn TransportAdapter> {

        let key = settings.pool_key();
        let mut pool = lock(&self.state.pool);

        if let Some(entry) = pool.get_mut(&key) {
            entry.references += 1;
            debug!("EngineInstance - reusing pooled client for {}, {} references", settings.endpoint(), entry.references);
            return entry.client.clone();
        }

        let instance_id = self.state.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let (dispatcher, event_pump) =
            match client_options.dispatch_mode {
                DispatchMode::Marshalled => { (self.state.dispatcher.clone(), None) }
                DispatchMode::Direct => { Dispatcher::new(DispatchMode::Direct) }
            };

        let context = ClientContext {
            instance_id,
            base_timestamp: self.state.base_timestamp,
            dispatcher,
            event_pump,
        };

        let client = MqttClient::new_with_context(settings.clone(), connect_options, client_options, transport_factory(), context);
        let client = Arc::new(Mutex::new(client));

        info!("EngineInstance - pooled new client {} for {}", instance_id, settings.endpoint());
        pool.insert(key, PoolEntry {
            client: client.clone(),
            references: 1,
        });

        client
    }

    /// Drops one reference to a pooled client.  The last release destroys the client and
    /// removes it from the pool.  Returns true if the client was destroyed.
    pub fn release_client(&self, settings: &ConnectionSettings) -> MqttifyResult<bool> {
        let key = settings.pool_key();

        let released = {
            let mut pool = lock(&self.state.pool);
            let entry = pool.get_mut(&key)
                .ok_or_else(|| MqttifyError::new_invalid_argument(None, format!("no pooled client for {}", settings.endpoint())))?;

            entry.references -= 1;
            if entry.references > 0 {
                return Ok(false);
            }

            pool.remove(&key)
        };

        if let Some(entry) = released {
            info!("EngineInstance - releasing last reference to client for {}", settings.endpoint());
            lock(&entry.client).destroy(Instant::now());
        }

        Ok(true)
    }

    /// Number of distinct clients in the pool
    pub fn client_count(&self) -> usize {
        lock(&self.state.pool).len()
    }

    /// Services every pooled client once.  Returns the earliest time any of them wants to be
    /// serviced again, along with the first service error encountered.
    pub fn tick(&self, now: Instant) -> (Option<Instant>, MqttifyResult<()>) {
        let clients : Vec<SharedClient> = lock(&self.state.pool).values().map(|entry| entry.client.clone()).collect();

        let mut next_time = None;
        let mut result = Ok(());
        for client in clients {
            let mut client = lock(&client);
            result = fold_mqtt_result(result, client.service(now));
            next_time = fold_optional_timepoint_min(&next_time, &client.next_service_time(now));
        }

        (next_time, result)
    }

    /// Starts a thread that ticks the engine until the handle is stopped or dropped.  The
    /// thread sleeps until the next requested service time, waking at least every `interval`.
    pub fn spawn_worker(&self, interval: Duration) -> MqttifyResult<WorkerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let engine = self.clone();

        let thread = std::thread::Builder::new()
            .name("mqttify-worker".to_string())
            .spawn(move || {
                debug!("EngineInstance worker - started");
                while !worker_stop.load(Ordering::Acquire) {
                    let now = Instant::now();
                    let (next_time, result) = engine.tick(now);
                    if let Err(error) = result {
                        debug!("EngineInstance worker - tick error: {}", error);
                    }

                    let mut sleep_duration = interval;
                    if let Some(next_time) = next_time {
                        sleep_duration = sleep_duration.min(next_time.saturating_duration_since(Instant::now()));
                    }

                    std::thread::sleep(sleep_duration);
                }
                debug!("EngineInstance worker - stopped");
            })?;

        Ok(WorkerHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// Controls a background worker.  Dropping the handle stops the worker and waits for it.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("WorkerHandle - worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientEvent, ConnectionState};
    use crate::mqtt::*;
    use crate::transport::testing::*;
    use crate::transport::NullTransport;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn settings_for(host: &str) -> ConnectionSettings {
        ConnectionSettings::new(Endpoint::new(ConnectionProtocol::Mqtt, host, 1883))
    }

    fn unique_connect_options() -> ConnectOptions {
        ConnectOptions::builder()
            .with_client_id(&uuid::Uuid::new_v4().to_string())
            .build()
    }

    #[test]
    fn equal_settings_share_a_client() {
        let engine = EngineInstance::new();
        let settings = settings_for("broker.local");

        let first = engine.get_or_create_client(&settings, unique_connect_options(), ClientOptions::builder().build(), || Box::new(NullTransport::default()));
        let second = engine.get_or_create_client(&settings, unique_connect_options(), ClientOptions::builder().build(), || panic!("pooled client should be reused"));
        let other = engine.get_or_create_client(&settings_for("other.local"), unique_connect_options(), ClientOptions::builder().build(), || Box::new(NullTransport::default()));

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(2, engine.client_count());
    }

    #[test]
    fn last_release_destroys_client() {
        let engine = EngineInstance::new();
        let settings = settings_for("broker.local");

        let client = engine.get_or_create_client(&settings, unique_connect_options(), ClientOptions::builder().build(), || Box::new(NullTransport::default()));
        engine.get_or_create_client(&settings, unique_connect_options(), ClientOptions::builder().build(), || Box::new(NullTransport::default()));

        assert_eq!(false, engine.release_client(&settings).unwrap());
        assert_eq!(1, engine.client_count());
        assert_eq!(true, engine.release_client(&settings).unwrap());
        assert_eq!(0, engine.client_count());

        assert_matches!(client.lock().unwrap().connect(Instant::now()), Err(MqttifyError::EngineDestroyed(_)));
        assert_matches!(engine.release_client(&settings), Err(MqttifyError::InvalidArgument(_)));
    }

    #[test]
    fn tick_services_pooled_clients() {
        let engine = EngineInstance::new();
        let settings = settings_for("broker.local");
        let (transport, network) = new_mock_transport();
        let mut transport = Some(transport);

        let client = engine.get_or_create_client(&settings, unique_connect_options(), ClientOptions::builder().build(), || Box::new(transport.take().unwrap()));

        let now = Instant::now();
        client.lock().unwrap().connect(now).unwrap();
        network.complete_connect();

        let (next_time, result) = engine.tick(now);
        assert!(result.is_ok());
        assert!(next_time.is_some());
        assert_matches!(network.take_written_packets(ProtocolVersion::Mqtt5).as_slice(), [MqttPacket::Connect(_)]);

        network.deliver(&MqttPacket::Connack(ConnackPacket::default()), ProtocolVersion::Mqtt5);
        engine.tick(now);
        assert_eq!(ConnectionState::Connected, client.lock().unwrap().state());
    }

    #[test]
    fn marshalled_clients_share_the_engine_pump() {
        let engine = EngineInstance::new();
        let pump = engine.take_event_pump().unwrap();
        assert!(engine.take_event_pump().is_none());

        let counter = Arc::new(AtomicUsize::new(0));
        for host in ["a.local", "b.local"] {
            let client = engine.get_or_create_client(&settings_for(host), unique_connect_options(), ClientOptions::builder().build(), || Box::new(NullTransport::default()));
            let mut client = client.lock().unwrap();
            assert!(client.take_event_pump().is_none());

            let listener_counter = counter.clone();
            client.add_event_listener(Arc::new(move |event: Arc<ClientEvent>| {
                if let ClientEvent::ConnectFailed(_) = event.as_ref() {
                    listener_counter.fetch_add(1, Ordering::SeqCst);
                }
            }));

            // the null transport refuses immediately
            client.connect(Instant::now()).unwrap();
        }

        assert_eq!(0, counter.load(Ordering::SeqCst));
        pump.pump();
        assert_eq!(2, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn worker_ticks_until_stopped() {
        let engine = EngineInstance::new();
        let settings = settings_for("broker.local");
        let (transport, network) = new_mock_transport();
        let mut transport = Some(transport);

        let client = engine.get_or_create_client(&settings, unique_connect_options(), ClientOptions::builder().build(), || Box::new(transport.take().unwrap()));
        client.lock().unwrap().connect(Instant::now()).unwrap();

        let mut worker = engine.spawn_worker(Duration::from_millis(5)).unwrap();
        network.complete_connect();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut written = Vec::new();
        while written.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
            written = network.take_written_packets(ProtocolVersion::Mqtt5);
        }

        worker.stop();
        assert_matches!(written.as_slice(), [MqttPacket::Connect(_)]);
    }
}
