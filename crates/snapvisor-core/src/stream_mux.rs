use crate::transport::{message_channel, MessageSink, MessageStream};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const COMMAND_CHANNEL: &str = "command";
pub const JSON_RPC_CHANNEL: &str = "jsonRpc";

/// Hook invoked for every frame crossing an observed channel.
///
/// Both callbacks see the unwrapped payload and run on the routing tasks, so
/// they must return quickly.
pub trait ChannelObserver: Send + Sync {
    fn on_outbound(&self, _frame: &Value) {}
    fn on_inbound(&self, _frame: &Value) {}
}

struct ChannelRoute {
    inbound: MessageSink,
    observer: Option<Arc<dyn ChannelObserver>>,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct MuxState {
    routes: HashMap<String, ChannelRoute>,
    destroyed: bool,
}

impl MuxState {
    fn close_all(&mut self) -> usize {
        let closed = self.routes.len();
        for (_, route) in self.routes.drain() {
            route.pump.abort();
        }
        closed
    }
}

pub struct StreamMultiplexer {
    state: Arc<Mutex<MuxState>>,
    transport: MessageSink,
    router: JoinHandle<()>,
}

impl StreamMultiplexer {
    pub fn new(transport: MessageStream) -> Self {
        let (sink, source) = transport.split();
        let state = Arc::new(Mutex::new(MuxState::default()));
        let router = tokio::spawn(route_inbound(source, Arc::clone(&state)));
        Self {
            state,
            transport: sink,
            router,
        }
    }

    pub fn create_channel(&self, name: &str) -> MessageStream {
        self.open(name, None)
    }

    pub fn create_observed_channel(
        &self,
        name: &str,
        observer: Arc<dyn ChannelObserver>,
    ) -> MessageStream {
        self.open(name, Some(observer))
    }

    fn open(&self, name: &str, observer: Option<Arc<dyn ChannelObserver>>) -> MessageStream {
        let mut state = lock(&self.state);
        if state.destroyed {
            tracing::debug!(channel = name, "multiplexer destroyed; handing out closed channel");
            return closed_stream();
        }

        let (inbound, channel_source) = message_channel();
        let (channel_sink, outbound) = message_channel();
        let pump = tokio::spawn(pump_outbound(
            name.to_string(),
            outbound,
            self.transport.clone(),
            observer.clone(),
        ));

        let route = ChannelRoute {
            inbound,
            observer,
            pump,
        };
        if let Some(previous) = state.routes.insert(name.to_string(), route) {
            tracing::warn!(channel = name, "replacing existing channel");
            previous.pump.abort();
        }

        MessageStream::from_parts(channel_sink, channel_source)
    }

    pub fn close_channel(&self, name: &str) -> bool {
        let removed = lock(&self.state).routes.remove(name);
        match removed {
            Some(route) => {
                route.pump.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_channel(&self, name: &str) -> bool {
        lock(&self.state).routes.contains_key(name)
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }

    pub fn destroy(&self) {
        let closed = {
            let mut state = lock(&self.state);
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.close_all()
        };
        self.router.abort();
        tracing::debug!(channels = closed, "multiplexer destroyed");
    }
}

impl Drop for StreamMultiplexer {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn lock(state: &Mutex<MuxState>) -> MutexGuard<'_, MuxState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed_stream() -> MessageStream {
    let (sink, _) = message_channel();
    let (_, source) = message_channel();
    MessageStream::from_parts(sink, source)
}

async fn pump_outbound(
    name: String,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    transport: MessageSink,
    observer: Option<Arc<dyn ChannelObserver>>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Some(observer) = &observer {
            observer.on_outbound(&frame);
        }
        if transport
            .send(json!({ "name": name, "data": frame }))
            .is_err()
        {
            tracing::debug!(channel = %name, "transport closed; dropping outbound frame");
            break;
        }
    }
}

async fn route_inbound(mut source: mpsc::UnboundedReceiver<Value>, state: Arc<Mutex<MuxState>>) {
    while let Some(frame) = source.recv().await {
        let (name, data) = match unwrap_envelope(frame) {
            Ok(parts) => parts,
            Err(reason) => {
                tracing::warn!(reason, "dropping frame without channel envelope");
                continue;
            }
        };

        let target = lock(&state)
            .routes
            .get(&name)
            .map(|route| (route.inbound.clone(), route.observer.clone()));
        let Some((inbound, observer)) = target else {
            tracing::debug!(channel = %name, "dropping frame for unknown channel");
            continue;
        };

        if let Some(observer) = observer {
            observer.on_inbound(&data);
        }
        if inbound.send(data).is_err() {
            tracing::debug!(channel = %name, "channel reader gone; dropping inbound frame");
        }
    }

    let closed = {
        let mut state = lock(&state);
        state.destroyed = true;
        state.close_all()
    };
    tracing::debug!(channels = closed, "transport ended; channels closed");
}

fn unwrap_envelope(frame: Value) -> Result<(String, Value), &'static str> {
    let Value::Object(mut envelope) = frame else {
        return Err("frame is not an object");
    };
    let Some(Value::String(name)) = envelope.remove("name") else {
        return Err("missing channel name");
    };
    let data = envelope.remove("data").unwrap_or(Value::Null);
    Ok((name, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn recv_soon(stream: &mut MessageStream) -> Option<Value> {
        tokio::time::timeout(Duration::from_millis(500), stream.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn outbound_frames_are_wrapped_with_channel_name() {
        let (host, mut peer) = MessageStream::pair();
        let mux = StreamMultiplexer::new(host);
        let command = mux.create_channel(COMMAND_CHANNEL);

        command.send(json!({"id": 1})).expect("queue frame");
        assert_eq!(
            recv_soon(&mut peer).await,
            Some(json!({"name": "command", "data": {"id": 1}}))
        );
    }

    #[tokio::test]
    async fn inbound_frames_reach_only_their_channel() {
        let (host, peer) = MessageStream::pair();
        let mux = StreamMultiplexer::new(host);
        let mut command = mux.create_channel(COMMAND_CHANNEL);
        let mut data = mux.create_channel(JSON_RPC_CHANNEL);

        peer.send(json!({"name": "jsonRpc", "data": "d1"})).expect("send");
        peer.send(json!({"name": "command", "data": "c1"})).expect("send");
        peer.send(json!({"name": "metrics", "data": "ignored"}))
            .expect("send");
        peer.send(json!({"data": "no name"})).expect("send");
        peer.send(json!({"name": "command", "data": "c2"})).expect("send");

        assert_eq!(recv_soon(&mut command).await, Some(json!("c1")));
        assert_eq!(recv_soon(&mut command).await, Some(json!("c2")));
        assert_eq!(recv_soon(&mut data).await, Some(json!("d1")));
    }

    #[tokio::test]
    async fn channel_preserves_write_order() {
        let (host, mut peer) = MessageStream::pair();
        let mux = StreamMultiplexer::new(host);
        let data = mux.create_channel(JSON_RPC_CHANNEL);

        for seq in 0..50 {
            data.send(json!(seq)).expect("queue frame");
        }
        for seq in 0..50 {
            assert_eq!(
                recv_soon(&mut peer).await,
                Some(json!({"name": "jsonRpc", "data": seq}))
            );
        }
    }

    #[tokio::test]
    async fn transport_eof_closes_every_channel() {
        let (host, peer) = MessageStream::pair();
        let mux = StreamMultiplexer::new(host);
        let mut command = mux.create_channel(COMMAND_CHANNEL);
        let mut data = mux.create_channel(JSON_RPC_CHANNEL);

        drop(peer);

        assert_eq!(recv_soon(&mut command).await, None);
        assert_eq!(recv_soon(&mut data).await, None);
        assert!(mux.is_destroyed());
    }

    #[tokio::test]
    async fn close_and_destroy_are_idempotent() {
        let (host, _peer) = MessageStream::pair();
        let mux = StreamMultiplexer::new(host);
        let mut command = mux.create_channel(COMMAND_CHANNEL);
        let _data = mux.create_channel(JSON_RPC_CHANNEL);

        assert!(mux.close_channel(COMMAND_CHANNEL));
        assert!(!mux.close_channel(COMMAND_CHANNEL));
        assert_eq!(recv_soon(&mut command).await, None);

        mux.destroy();
        mux.destroy();
        assert!(!mux.has_channel(JSON_RPC_CHANNEL));

        let mut late = mux.create_channel("late");
        assert_eq!(recv_soon(&mut late).await, None);
        assert!(late.send(json!(1)).is_err());
    }

    #[tokio::test]
    async fn observer_sees_both_directions() {
        #[derive(Default)]
        struct Counting {
            outbound: AtomicUsize,
            inbound: AtomicUsize,
        }

        impl ChannelObserver for Counting {
            fn on_outbound(&self, _frame: &Value) {
                self.outbound.fetch_add(1, Ordering::SeqCst);
            }

            fn on_inbound(&self, _frame: &Value) {
                self.inbound.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (host, mut peer) = MessageStream::pair();
        let mux = StreamMultiplexer::new(host);
        let observer = Arc::new(Counting::default());
        let mut data = mux.create_observed_channel(JSON_RPC_CHANNEL, observer.clone());

        data.send(json!("out")).expect("queue frame");
        assert!(recv_soon(&mut peer).await.is_some());
        peer.send(json!({"name": "jsonRpc", "data": "in"}))
            .expect("send");
        assert_eq!(recv_soon(&mut data).await, Some(json!("in")));

        assert_eq!(observer.outbound.load(Ordering::SeqCst), 1);
        assert_eq!(observer.inbound.load(Ordering::SeqCst), 1);
    }
}
