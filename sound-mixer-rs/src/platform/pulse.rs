//! PulseAudio backend.
//!
//! libpulse objects are single-threaded, so a dedicated worker thread owns the
//! mainloop and the context. Handles talk to it over a command channel and
//! block on a per-request reply channel. Each request also writes a byte to a
//! socket the mainloop polls, so the worker sleeps in the mainloop until
//! either the server or a handle has something for it.
//!
//! Sink and source change events are picked up by the worker and re-queried,
//! then handed to a separate notifier thread that runs the subscribers. A
//! subscriber may therefore call back into its endpoint without waiting on
//! the thread that has to answer it.
//!
//! Endpoint ids are `output:<sink name>` and `input:<source name>`. Sink
//! monitor sources are not listed.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;

use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::introspect::{
    SinkInfo, SinkInputInfo, SourceInfo, SourceOutputInfo,
};
use libpulse_binding::context::subscribe::{
    Facility, InterestMaskSet, Operation as SubscribeOperation,
};
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::mainloop::api::Mainloop as MainloopApi;
use libpulse_binding::mainloop::events::io::{FlagSet as IoFlagSet, IoEvent};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::operation::{Operation, State as OperationState};
use libpulse_binding::proplist::properties::{APPLICATION_NAME, APPLICATION_PROCESS_BINARY};
use libpulse_binding::volume::{ChannelVolumes, Volume};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{
    AudioProvider, EndpointHandle, SessionHandle, Subscription, VolumeCallback,
    VolumeNotification,
};
use crate::audio::{clamp_volume, AudioError, DeviceDescriptor, DeviceKind, Result, SessionState};

const WORKER_THREAD: &str = "pulse-worker";
const NOTIFIER_THREAD: &str = "pulse-events";

type WakeEvent = IoEvent<<Mainloop as MainloopApi>::MI>;

/// Convert a PulseAudio volume to a scalar, 100% mapping to 1.0.
pub fn volume_from_pulse(volume: Volume) -> f32 {
    (volume.0 as f64 / Volume::NORMAL.0 as f64).min(1.0) as f32
}

/// Convert a scalar in [0, 1] to a PulseAudio volume.
pub fn volume_to_pulse(volume: f32) -> Volume {
    Volume((clamp_volume(volume) as f64 * Volume::NORMAL.0 as f64).round() as u32)
}

/// Master volume as PulseAudio reports it: the loudest channel.
pub fn master_volume(channels: &[f32]) -> f32 {
    channels.iter().copied().fold(0.0, f32::max)
}

/// Rescale channels so the loudest one equals `volume`, keeping the balance.
pub fn scale_channels(channels: &[f32], volume: f32) -> Vec<f32> {
    let volume = clamp_volume(volume);
    let max = master_volume(channels);
    if max <= f32::EPSILON {
        return vec![volume; channels.len()];
    }
    channels
        .iter()
        .map(|c| clamp_volume(c / max * volume))
        .collect()
}

fn channels_from_pulse(volumes: &ChannelVolumes) -> Vec<f32> {
    volumes.get().iter().map(|v| volume_from_pulse(*v)).collect()
}

fn channels_to_pulse(levels: &[f32]) -> ChannelVolumes {
    let mut volumes = ChannelVolumes::default();
    volumes.set(levels.len() as u8, Volume::MUTED);
    for (slot, level) in volumes.get_mut().iter_mut().zip(levels) {
        *slot = volume_to_pulse(*level);
    }
    volumes
}

/// Split `output:<name>` / `input:<name>` into kind and server name.
pub fn parse_endpoint_id(id: &str) -> Option<(DeviceKind, &str)> {
    if let Some(name) = id.strip_prefix("output:") {
        Some((DeviceKind::Output, name))
    } else {
        id.strip_prefix("input:").map(|name| (DeviceKind::Input, name))
    }
}

pub fn endpoint_id(kind: DeviceKind, name: &str) -> String {
    match kind {
        DeviceKind::Input => format!("input:{name}"),
        _ => format!("output:{name}"),
    }
}

#[derive(Debug, Clone)]
struct EndpointInfo {
    desc: DeviceDescriptor,
    index: u32,
    channels: Vec<f32>,
    muted: bool,
}

impl EndpointInfo {
    fn from_sink(info: &SinkInfo) -> Self {
        let name = info.name.as_deref().unwrap_or_default();
        let description = info.description.as_deref().unwrap_or(name);
        Self {
            desc: DeviceDescriptor::new(
                endpoint_id(DeviceKind::Output, name),
                description,
                DeviceKind::Output,
            ),
            index: info.index,
            channels: channels_from_pulse(&info.volume),
            muted: info.mute,
        }
    }

    fn from_source(info: &SourceInfo) -> Self {
        let name = info.name.as_deref().unwrap_or_default();
        let description = info.description.as_deref().unwrap_or(name);
        Self {
            desc: DeviceDescriptor::new(
                endpoint_id(DeviceKind::Input, name),
                description,
                DeviceKind::Input,
            ),
            index: info.index,
            channels: channels_from_pulse(&info.volume),
            muted: info.mute,
        }
    }

    fn notification(&self) -> VolumeNotification {
        VolumeNotification {
            volume: master_volume(&self.channels),
            muted: self.muted,
            channels: Some(self.channels.len() as u32),
        }
    }
}

/// A sink input (playback) or source output (recording) stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StreamKey {
    kind: DeviceKind,
    index: u32,
}

#[derive(Debug, Clone)]
struct StreamInfo {
    key: StreamKey,
    device_index: u32,
    channels: Vec<f32>,
    muted: bool,
    corked: bool,
    display_name: String,
    process_path: String,
}

impl StreamInfo {
    fn from_sink_input(info: &SinkInputInfo) -> Self {
        let fallback = info.name.as_deref().unwrap_or_default();
        Self {
            key: StreamKey {
                kind: DeviceKind::Output,
                index: info.index,
            },
            device_index: info.sink,
            channels: channels_from_pulse(&info.volume),
            muted: info.mute,
            corked: info.corked,
            display_name: info
                .proplist
                .get_str(APPLICATION_NAME)
                .unwrap_or_else(|| fallback.to_string()),
            process_path: info
                .proplist
                .get_str(APPLICATION_PROCESS_BINARY)
                .unwrap_or_default(),
        }
    }

    fn from_source_output(info: &SourceOutputInfo) -> Self {
        let fallback = info.name.as_deref().unwrap_or_default();
        Self {
            key: StreamKey {
                kind: DeviceKind::Input,
                index: info.index,
            },
            device_index: info.source,
            channels: channels_from_pulse(&info.volume),
            muted: info.mute,
            corked: info.corked,
            display_name: info
                .proplist
                .get_str(APPLICATION_NAME)
                .unwrap_or_else(|| fallback.to_string()),
            process_path: info
                .proplist
                .get_str(APPLICATION_PROCESS_BINARY)
                .unwrap_or_default(),
        }
    }
}

type Reply<T> = Sender<Result<T>>;

enum Request {
    Endpoints {
        reply: Reply<Vec<DeviceDescriptor>>,
    },
    DefaultEndpoint {
        kind: DeviceKind,
        reply: Reply<Option<String>>,
    },
    Endpoint {
        id: String,
        reply: Reply<EndpointInfo>,
    },
    SetEndpointChannels {
        id: String,
        levels: Vec<f32>,
        reply: Reply<()>,
    },
    SetEndpointMute {
        id: String,
        muted: bool,
        reply: Reply<()>,
    },
    Streams {
        id: String,
        reply: Reply<Vec<StreamInfo>>,
    },
    Stream {
        key: StreamKey,
        reply: Reply<Option<StreamInfo>>,
    },
    SetStreamChannels {
        key: StreamKey,
        levels: Vec<f32>,
        reply: Reply<()>,
    },
    SetStreamMute {
        key: StreamKey,
        muted: bool,
        reply: Reply<()>,
    },
}

#[derive(Default)]
struct Subscribers {
    callbacks: Mutex<HashMap<String, Vec<(u64, VolumeCallback)>>>,
    next: AtomicU64,
}

impl Subscribers {
    fn add(&self, id: &str, callback: VolumeCallback) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .entry(id.to_string())
            .or_default()
            .push((token, callback));
        token
    }

    fn remove(&self, id: &str, token: u64) {
        let mut callbacks = self.callbacks.lock();
        if let Some(list) = callbacks.get_mut(id) {
            list.retain(|(t, _)| *t != token);
            if list.is_empty() {
                callbacks.remove(id);
            }
        }
    }

    fn is_watched(&self, id: &str) -> bool {
        self.callbacks.lock().contains_key(id)
    }

    fn for_endpoint(&self, id: &str) -> Vec<VolumeCallback> {
        self.callbacks
            .lock()
            .get(id)
            .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

/// A re-queried endpoint change on its way to the subscribers.
type Change = (String, VolumeNotification);

/// Start the thread that runs subscriber callbacks for changes sent to the
/// returned channel. It exits once every sender is gone.
fn spawn_notifier(subscribers: Arc<Subscribers>) -> io::Result<Sender<Change>> {
    let (changes, inbox) = mpsc::channel::<Change>();
    thread::Builder::new()
        .name(NOTIFIER_THREAD.to_string())
        .spawn(move || {
            for (id, notification) in inbox {
                for callback in subscribers.for_endpoint(&id) {
                    callback(notification);
                }
            }
            debug!("PulseAudio notifier stopped");
        })?;
    Ok(changes)
}

fn worker_gone() -> AudioError {
    AudioError::Platform("PulseAudio worker stopped".to_string())
}

/// Command channel into the worker thread.
#[derive(Clone)]
struct Client {
    requests: Sender<Request>,
    subscribers: Arc<Subscribers>,
    /// Write end of the socket the worker's mainloop polls.
    waker: Arc<UnixStream>,
}

impl Client {
    fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        // The reply could only come from this very thread
        if thread::current().name() == Some(WORKER_THREAD) {
            return Err(AudioError::Platform(
                "PulseAudio request issued from the worker thread".to_string(),
            ));
        }
        let (reply, response) = mpsc::channel();
        self.requests
            .send(request(reply))
            .map_err(|_| worker_gone())?;
        // A full socket already has a wakeup pending
        let _ = (&*self.waker).write(&[1]);
        response.recv().map_err(|_| worker_gone())?
    }
}

fn waker_error(err: io::Error) -> AudioError {
    AudioError::Platform(format!("failed to set up PulseAudio wakeups: {err}"))
}

/// Provider backed by a PulseAudio (or PipeWire-Pulse) server.
pub struct PulseProvider {
    client: Client,
}

impl PulseProvider {
    /// Connect to the default server and start the worker thread.
    pub fn connect() -> Result<Self> {
        let (requests, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (waker, wake) = UnixStream::pair().map_err(waker_error)?;
        waker.set_nonblocking(true).map_err(waker_error)?;
        wake.set_nonblocking(true).map_err(waker_error)?;

        let subscribers = Arc::new(Subscribers::default());
        let changes = spawn_notifier(Arc::clone(&subscribers)).map_err(|e| {
            AudioError::Platform(format!("failed to spawn PulseAudio notifier: {e}"))
        })?;
        let worker_subscribers = Arc::clone(&subscribers);

        thread::Builder::new()
            .name(WORKER_THREAD.to_string())
            .spawn(move || match Worker::connect(worker_subscribers, changes, wake) {
                Ok(worker) => {
                    let _ = ready_tx.send(Ok(()));
                    worker.run(inbox);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .map_err(|e| AudioError::Platform(format!("failed to spawn PulseAudio worker: {e}")))?;

        ready_rx.recv().map_err(|_| worker_gone())??;
        info!("Connected to PulseAudio");
        Ok(Self {
            client: Client {
                requests,
                subscribers,
                waker: Arc::new(waker),
            },
        })
    }
}

impl AudioProvider for PulseProvider {
    fn name(&self) -> &'static str {
        "pulse"
    }

    fn enumerate_endpoints(&self, kind: DeviceKind) -> Result<Vec<DeviceDescriptor>> {
        let all = self.client.call(|reply| Request::Endpoints { reply })?;
        Ok(all.into_iter().filter(|d| d.kind.matches(kind)).collect())
    }

    fn default_endpoint(&self, kind: DeviceKind) -> Result<Option<String>> {
        self.client
            .call(|reply| Request::DefaultEndpoint { kind, reply })
    }

    fn resolve_endpoint(&self, id: &str) -> Result<Box<dyn EndpointHandle>> {
        let id = id.to_string();
        let info = self.client.call(|reply| Request::Endpoint {
            id: id.clone(),
            reply,
        })?;
        Ok(Box::new(PulseEndpoint {
            id: info.desc.id,
            client: self.client.clone(),
        }))
    }
}

struct PulseEndpoint {
    id: String,
    client: Client,
}

impl PulseEndpoint {
    fn info(&self) -> Result<EndpointInfo> {
        self.client.call(|reply| Request::Endpoint {
            id: self.id.clone(),
            reply,
        })
    }
}

impl EndpointHandle for PulseEndpoint {
    fn descriptor(&self) -> Result<DeviceDescriptor> {
        Ok(self.info()?.desc)
    }

    fn volume(&self) -> Result<f32> {
        Ok(master_volume(&self.info()?.channels))
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        let levels = scale_channels(&self.info()?.channels, volume);
        self.set_channel_volumes(&levels)
    }

    fn mute(&self) -> Result<bool> {
        Ok(self.info()?.muted)
    }

    fn set_mute(&self, muted: bool) -> Result<()> {
        self.client.call(|reply| Request::SetEndpointMute {
            id: self.id.clone(),
            muted,
            reply,
        })
    }

    fn channel_volumes(&self) -> Result<Vec<f32>> {
        Ok(self.info()?.channels)
    }

    fn set_channel_volumes(&self, channels: &[f32]) -> Result<()> {
        self.client.call(|reply| Request::SetEndpointChannels {
            id: self.id.clone(),
            levels: channels.to_vec(),
            reply,
        })
    }

    fn sessions(&self) -> Result<Vec<Box<dyn SessionHandle>>> {
        let streams = self.client.call(|reply| Request::Streams {
            id: self.id.clone(),
            reply,
        })?;
        Ok(streams
            .into_iter()
            .map(|stream| {
                Box::new(PulseSession {
                    key: stream.key,
                    display_name: stream.display_name,
                    process_path: stream.process_path,
                    client: self.client.clone(),
                }) as Box<dyn SessionHandle>
            })
            .collect())
    }

    fn subscribe(&self, callback: VolumeCallback) -> Result<Subscription> {
        let token = self.client.subscribers.add(&self.id, callback);
        let subscribers = Arc::clone(&self.client.subscribers);
        let id = self.id.clone();
        Ok(Subscription::new(move || subscribers.remove(&id, token)))
    }
}

struct PulseSession {
    key: StreamKey,
    display_name: String,
    process_path: String,
    client: Client,
}

impl PulseSession {
    fn info(&self) -> Result<StreamInfo> {
        self.client
            .call(|reply| Request::Stream {
                key: self.key,
                reply,
            })?
            .ok_or_else(|| AudioError::SessionNotFound {
                session_id: self.identifier_string(),
            })
    }

    fn identifier_string(&self) -> String {
        match self.key.kind {
            DeviceKind::Input => format!("source-output:{}", self.key.index),
            _ => format!("sink-input:{}", self.key.index),
        }
    }
}

impl SessionHandle for PulseSession {
    fn identifier(&self) -> Option<String> {
        Some(self.identifier_string())
    }

    fn process_path(&self) -> String {
        self.process_path.clone()
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    fn state(&self) -> Result<SessionState> {
        let stream = self.client.call(|reply| Request::Stream {
            key: self.key,
            reply,
        })?;
        Ok(match stream {
            None => SessionState::Expired,
            Some(s) if s.corked => SessionState::Inactive,
            Some(_) => SessionState::Active,
        })
    }

    fn volume(&self) -> Result<f32> {
        Ok(master_volume(&self.info()?.channels))
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        let levels = scale_channels(&self.info()?.channels, volume);
        self.set_channel_volumes(&levels)
    }

    fn mute(&self) -> Result<bool> {
        Ok(self.info()?.muted)
    }

    fn set_mute(&self, muted: bool) -> Result<()> {
        self.client.call(|reply| Request::SetStreamMute {
            key: self.key,
            muted,
            reply,
        })
    }

    fn channel_volumes(&self) -> Result<Vec<f32>> {
        Ok(self.info()?.channels)
    }

    fn set_channel_volumes(&self, channels: &[f32]) -> Result<()> {
        self.client.call(|reply| Request::SetStreamChannels {
            key: self.key,
            levels: channels.to_vec(),
            reply,
        })
    }
}

/// Owner of the libpulse mainloop; lives on the worker thread only.
struct Worker {
    // Freed before the mainloop that owns it
    _wake_event: WakeEvent,
    mainloop: Mainloop,
    context: Context,
    subscribers: Arc<Subscribers>,
    changed: Rc<RefCell<VecDeque<(Facility, u32)>>>,
    notifier: Sender<Change>,
}

impl Worker {
    fn connect(
        subscribers: Arc<Subscribers>,
        notifier: Sender<Change>,
        wake: UnixStream,
    ) -> Result<Self> {
        let mut mainloop = Mainloop::new().ok_or_else(|| {
            AudioError::Platform("failed to create PulseAudio mainloop".to_string())
        })?;
        let mut context = Context::new(&mainloop, "sound-mixer").ok_or_else(|| {
            AudioError::Platform("failed to create PulseAudio context".to_string())
        })?;
        context
            .connect(None, ContextFlagSet::NOFLAGS, None)
            .map_err(|e| AudioError::Platform(format!("PulseAudio connection failed: {e}")))?;

        loop {
            match mainloop.iterate(true) {
                IterateResult::Success(_) => {}
                IterateResult::Quit(_) | IterateResult::Err(_) => {
                    return Err(AudioError::Platform(
                        "PulseAudio mainloop stopped during connect".to_string(),
                    ));
                }
            }
            match context.get_state() {
                ContextState::Ready => break,
                ContextState::Failed | ContextState::Terminated => {
                    return Err(AudioError::Platform(
                        "PulseAudio context failed to become ready".to_string(),
                    ));
                }
                _ => {}
            }
        }

        let changed = Rc::new(RefCell::new(VecDeque::new()));
        let queue = Rc::clone(&changed);
        context.set_subscribe_callback(Some(Box::new(move |facility, operation, index| {
            if let (
                Some(facility @ (Facility::Sink | Facility::Source)),
                Some(SubscribeOperation::Changed),
            ) = (facility, operation)
            {
                queue.borrow_mut().push_back((facility, index));
            }
        })));
        context.subscribe(InterestMaskSet::SINK | InterestMaskSet::SOURCE, |_| {});

        // Requests are picked up by the run loop; the event only has to end
        // the blocking iteration.
        let fd = wake.as_raw_fd();
        let wake_event = mainloop
            .new_io_event(
                fd,
                IoFlagSet::INPUT,
                Box::new(move |_event, _fd, _flags| drain_wakeups(&wake)),
            )
            .ok_or_else(|| {
                AudioError::Platform("failed to watch the PulseAudio wake socket".to_string())
            })?;

        Ok(Self {
            _wake_event: wake_event,
            mainloop,
            context,
            subscribers,
            changed,
            notifier,
        })
    }

    fn run(mut self, inbox: Receiver<Request>) {
        loop {
            loop {
                match inbox.try_recv() {
                    Ok(request) => self.handle(request),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("PulseAudio worker shutting down");
                        return;
                    }
                }
            }

            match self.mainloop.iterate(true) {
                IterateResult::Success(_) => {}
                IterateResult::Quit(_) | IterateResult::Err(_) => {
                    warn!("PulseAudio mainloop stopped");
                    return;
                }
            }
            self.flush_changes();
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Endpoints { reply } => {
                let descriptors = self
                    .endpoints()
                    .map(|list| list.into_iter().map(|e| e.desc).collect());
                let _ = reply.send(descriptors);
            }
            Request::DefaultEndpoint { kind, reply } => {
                let _ = reply.send(self.default_endpoint(kind));
            }
            Request::Endpoint { id, reply } => {
                let _ = reply.send(self.endpoint(&id));
            }
            Request::SetEndpointChannels { id, levels, reply } => {
                let _ = reply.send(self.set_endpoint_channels(&id, &levels));
            }
            Request::SetEndpointMute { id, muted, reply } => {
                let _ = reply.send(self.set_endpoint_mute(&id, muted));
            }
            Request::Streams { id, reply } => {
                let _ = reply.send(self.streams(&id));
            }
            Request::Stream { key, reply } => {
                let _ = reply.send(self.stream(key));
            }
            Request::SetStreamChannels { key, levels, reply } => {
                let _ = reply.send(self.set_stream_channels(key, &levels));
            }
            Request::SetStreamMute { key, muted, reply } => {
                let _ = reply.send(self.set_stream_mute(key, muted));
            }
        }
    }

    /// Iterate the mainloop until `operation` completes.
    fn wait<C: ?Sized>(&mut self, operation: Operation<C>) -> Result<()> {
        while operation.get_state() == OperationState::Running {
            match self.mainloop.iterate(true) {
                IterateResult::Success(_) => {}
                IterateResult::Quit(_) | IterateResult::Err(_) => {
                    return Err(AudioError::Platform(
                        "PulseAudio mainloop stopped".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Wait for a setter and turn its success flag into a result.
    fn wait_success(
        &mut self,
        operation: Operation<dyn FnMut(bool)>,
        ok: Rc<RefCell<bool>>,
        what: &str,
    ) -> Result<()> {
        self.wait(operation)?;
        if *ok.borrow() {
            Ok(())
        } else {
            Err(AudioError::Platform(format!("PulseAudio rejected {what}")))
        }
    }

    fn endpoints(&mut self) -> Result<Vec<EndpointInfo>> {
        let found = Rc::new(RefCell::new(Vec::new()));

        let sinks = Rc::clone(&found);
        let operation = self.context.introspect().get_sink_info_list(move |result| {
            if let ListResult::Item(info) = result {
                sinks.borrow_mut().push(EndpointInfo::from_sink(info));
            }
        });
        self.wait(operation)?;

        let sources = Rc::clone(&found);
        let operation = self.context.introspect().get_source_info_list(move |result| {
            if let ListResult::Item(info) = result {
                if info.monitor_of_sink.is_none() {
                    sources.borrow_mut().push(EndpointInfo::from_source(info));
                }
            }
        });
        self.wait(operation)?;

        Ok(found.take())
    }

    fn default_endpoint(&mut self, kind: DeviceKind) -> Result<Option<String>> {
        let found = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&found);
        let operation = self.context.introspect().get_server_info(move |info| {
            let name = match kind {
                DeviceKind::Output => info.default_sink_name.as_deref(),
                DeviceKind::Input => info.default_source_name.as_deref(),
                DeviceKind::All => None,
            };
            *slot.borrow_mut() = name.map(|n| endpoint_id(kind, n));
        });
        self.wait(operation)?;
        Ok(found.take())
    }

    fn endpoint(&mut self, id: &str) -> Result<EndpointInfo> {
        let not_found = || AudioError::DeviceNotFound {
            device_id: id.to_string(),
        };
        let (kind, name) = parse_endpoint_id(id).ok_or_else(not_found)?;

        let found = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&found);
        let introspect = self.context.introspect();
        match kind {
            DeviceKind::Input => {
                let operation = introspect.get_source_info_by_name(name, move |result| {
                    if let ListResult::Item(info) = result {
                        *slot.borrow_mut() = Some(EndpointInfo::from_source(info));
                    }
                });
                self.wait(operation)?;
            }
            _ => {
                let operation = introspect.get_sink_info_by_name(name, move |result| {
                    if let ListResult::Item(info) = result {
                        *slot.borrow_mut() = Some(EndpointInfo::from_sink(info));
                    }
                });
                self.wait(operation)?;
            }
        }
        found.take().ok_or_else(not_found)
    }

    fn set_endpoint_channels(&mut self, id: &str, levels: &[f32]) -> Result<()> {
        let info = self.endpoint(id)?;
        let (kind, name) = parse_endpoint_id(id).ok_or_else(|| AudioError::DeviceNotFound {
            device_id: id.to_string(),
        })?;
        // Never change the channel map, only the levels
        let mut current = info.channels;
        for (slot, level) in current.iter_mut().zip(levels) {
            *slot = clamp_volume(*level);
        }
        let volumes = channels_to_pulse(&current);

        let ok = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&ok);
        let callback: Box<dyn FnMut(bool)> = Box::new(move |success| *flag.borrow_mut() = success);
        let operation = match kind {
            DeviceKind::Input => self
                .context
                .introspect()
                .set_source_volume_by_name(name, &volumes, Some(callback)),
            _ => self
                .context
                .introspect()
                .set_sink_volume_by_name(name, &volumes, Some(callback)),
        };
        self.wait_success(operation, ok, "volume change")
    }

    fn set_endpoint_mute(&mut self, id: &str, muted: bool) -> Result<()> {
        let (kind, name) = parse_endpoint_id(id).ok_or_else(|| AudioError::DeviceNotFound {
            device_id: id.to_string(),
        })?;
        let ok = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&ok);
        let callback: Box<dyn FnMut(bool)> = Box::new(move |success| *flag.borrow_mut() = success);
        let operation = match kind {
            DeviceKind::Input => self
                .context
                .introspect()
                .set_source_mute_by_name(name, muted, Some(callback)),
            _ => self
                .context
                .introspect()
                .set_sink_mute_by_name(name, muted, Some(callback)),
        };
        self.wait_success(operation, ok, "mute change")
    }

    fn streams(&mut self, id: &str) -> Result<Vec<StreamInfo>> {
        let device = self.endpoint(id)?;
        let found = Rc::new(RefCell::new(Vec::new()));
        let slot = Rc::clone(&found);
        let introspect = self.context.introspect();
        match device.desc.kind {
            DeviceKind::Input => {
                let operation = introspect.get_source_output_info_list(move |result| {
                    if let ListResult::Item(info) = result {
                        slot.borrow_mut().push(StreamInfo::from_source_output(info));
                    }
                });
                self.wait(operation)?;
            }
            _ => {
                let operation = introspect.get_sink_input_info_list(move |result| {
                    if let ListResult::Item(info) = result {
                        slot.borrow_mut().push(StreamInfo::from_sink_input(info));
                    }
                });
                self.wait(operation)?;
            }
        }
        let mut streams = found.take();
        streams.retain(|s| s.device_index == device.index);
        Ok(streams)
    }

    fn stream(&mut self, key: StreamKey) -> Result<Option<StreamInfo>> {
        let found = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&found);
        let introspect = self.context.introspect();
        match key.kind {
            DeviceKind::Input => {
                let operation = introspect.get_source_output_info(key.index, move |result| {
                    if let ListResult::Item(info) = result {
                        *slot.borrow_mut() = Some(StreamInfo::from_source_output(info));
                    }
                });
                self.wait(operation)?;
            }
            _ => {
                let operation = introspect.get_sink_input_info(key.index, move |result| {
                    if let ListResult::Item(info) = result {
                        *slot.borrow_mut() = Some(StreamInfo::from_sink_input(info));
                    }
                });
                self.wait(operation)?;
            }
        }
        Ok(found.take())
    }

    fn set_stream_channels(&mut self, key: StreamKey, levels: &[f32]) -> Result<()> {
        let stream = self.stream(key)?.ok_or_else(|| AudioError::SessionNotFound {
            session_id: key.index.to_string(),
        })?;
        let mut current = stream.channels;
        for (slot, level) in current.iter_mut().zip(levels) {
            *slot = clamp_volume(*level);
        }
        let volumes = channels_to_pulse(&current);

        let ok = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&ok);
        let callback: Box<dyn FnMut(bool)> = Box::new(move |success| *flag.borrow_mut() = success);
        let operation = match key.kind {
            DeviceKind::Input => self
                .context
                .introspect()
                .set_source_output_volume(key.index, &volumes, Some(callback)),
            _ => self
                .context
                .introspect()
                .set_sink_input_volume(key.index, &volumes, Some(callback)),
        };
        self.wait_success(operation, ok, "stream volume change")
    }

    fn set_stream_mute(&mut self, key: StreamKey, muted: bool) -> Result<()> {
        let ok = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&ok);
        let callback: Box<dyn FnMut(bool)> = Box::new(move |success| *flag.borrow_mut() = success);
        let operation = match key.kind {
            DeviceKind::Input => self
                .context
                .introspect()
                .set_source_output_mute(key.index, muted, Some(callback)),
            _ => self
                .context
                .introspect()
                .set_sink_input_mute(key.index, muted, Some(callback)),
        };
        self.wait_success(operation, ok, "stream mute change")
    }

    /// Re-query endpoints that reported a change and pass them to the notifier.
    fn flush_changes(&mut self) {
        loop {
            let next = self.changed.borrow_mut().pop_front();
            let Some((facility, index)) = next else {
                break;
            };

            let found = Rc::new(RefCell::new(None));
            let slot = Rc::clone(&found);
            let introspect = self.context.introspect();
            let result = if facility == Facility::Source {
                let operation = introspect.get_source_info_by_index(index, move |result| {
                    if let ListResult::Item(info) = result {
                        *slot.borrow_mut() = Some(EndpointInfo::from_source(info));
                    }
                });
                self.wait(operation)
            } else {
                let operation = introspect.get_sink_info_by_index(index, move |result| {
                    if let ListResult::Item(info) = result {
                        *slot.borrow_mut() = Some(EndpointInfo::from_sink(info));
                    }
                });
                self.wait(operation)
            };
            if let Err(err) = result {
                warn!(error = %err, "Failed to query changed endpoint");
                continue;
            }

            let Some(info) = found.take() else {
                continue;
            };
            if !self.subscribers.is_watched(&info.desc.id) {
                continue;
            }
            trace!(device_id = %info.desc.id, "Endpoint changed");
            let notification = info.notification();
            if self.notifier.send((info.desc.id, notification)).is_err() {
                warn!("PulseAudio notifier is gone; change dropped");
            }
        }
    }
}

/// Empty the wake socket. Bytes carry no data; the requests are in the inbox.
fn drain_wakeups(mut wake: &UnixStream) {
    let mut buf = [0u8; 64];
    while let Ok(read) = wake.read(&mut buf) {
        if read < buf.len() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn change(volume: f32) -> Change {
        let notification = VolumeNotification {
            volume,
            muted: false,
            channels: Some(2),
        };
        ("output:sink".to_string(), notification)
    }

    #[test]
    fn test_volume_conversion() {
        assert_eq!(volume_from_pulse(Volume::NORMAL), 1.0);
        assert_eq!(volume_from_pulse(Volume::MUTED), 0.0);
        // Amplified volumes above 100% are reported as full scale
        assert_eq!(volume_from_pulse(Volume(Volume::NORMAL.0 * 2)), 1.0);
        assert_eq!(volume_to_pulse(1.0), Volume::NORMAL);
        assert_eq!(volume_to_pulse(2.0), Volume::NORMAL);
        assert!((volume_from_pulse(volume_to_pulse(0.37)) - 0.37).abs() < 1e-4);
    }

    #[test]
    fn test_scale_channels_keeps_balance() {
        let scaled = scale_channels(&[0.5, 0.25], 1.0);
        assert!((scaled[0] - 1.0).abs() < 1e-6);
        assert!((scaled[1] - 0.5).abs() < 1e-6);
        assert_eq!(scale_channels(&[0.0, 0.0], 0.4), vec![0.4, 0.4]);
        assert_eq!(master_volume(&[0.2, 0.7, 0.1]), 0.7);
    }

    #[test]
    fn test_subscribers_can_query_back_while_notified() {
        let subscribers = Arc::new(Subscribers::default());
        let (requests, inbox) = mpsc::channel::<Sender<f32>>();
        let (done, finished) = mpsc::channel();
        subscribers.add(
            "output:sink",
            Arc::new(move |_| {
                // Round trip through the thread that reported the change
                let (reply, response) = mpsc::channel();
                requests.send(reply).unwrap();
                let volume = response.recv().unwrap();
                done.send((thread::current().id(), volume)).unwrap();
            }),
        );
        let notifier = spawn_notifier(Arc::clone(&subscribers)).unwrap();

        notifier.send(change(0.5)).unwrap();
        let reply = inbox.recv_timeout(TIMEOUT).unwrap();
        reply.send(0.5).unwrap();

        let (ran_on, volume) = finished.recv_timeout(TIMEOUT).unwrap();
        assert_ne!(ran_on, thread::current().id());
        assert_eq!(volume, 0.5);
    }

    #[test]
    fn test_notifier_skips_unwatched_endpoints() {
        let subscribers = Arc::new(Subscribers::default());
        let (seen, received) = mpsc::channel();
        let token = subscribers.add(
            "output:sink",
            Arc::new(move |n: VolumeNotification| seen.send(n.volume).unwrap()),
        );
        assert!(subscribers.is_watched("output:sink"));
        let notifier = spawn_notifier(Arc::clone(&subscribers)).unwrap();

        notifier.send(change(0.25)).unwrap();
        assert_eq!(received.recv_timeout(TIMEOUT).unwrap(), 0.25);

        subscribers.remove("output:sink", token);
        assert!(!subscribers.is_watched("output:sink"));
        notifier.send(change(0.75)).unwrap();
        drop(notifier);
        assert!(received.recv_timeout(TIMEOUT).is_err());
    }

    #[test]
    fn test_worker_thread_cannot_call_itself() {
        let (requests, _inbox) = mpsc::channel();
        let (waker, _wake) = UnixStream::pair().unwrap();
        let client = Client {
            requests,
            subscribers: Arc::default(),
            waker: Arc::new(waker),
        };
        let result = thread::Builder::new()
            .name(WORKER_THREAD.to_string())
            .spawn(move || client.call(|reply| Request::Endpoints { reply }))
            .unwrap()
            .join()
            .unwrap();
        assert!(matches!(result, Err(AudioError::Platform(_))));
    }

    #[test]
    fn test_requests_wake_the_worker() {
        let (requests, inbox) = mpsc::channel();
        let (waker, wake) = UnixStream::pair().unwrap();
        waker.set_nonblocking(true).unwrap();
        wake.set_nonblocking(true).unwrap();
        let client = Client {
            requests,
            subscribers: Arc::default(),
            waker: Arc::new(waker),
        };

        let caller = thread::spawn(move || client.call(|reply| Request::Endpoints { reply }));
        let request = inbox.recv_timeout(TIMEOUT).unwrap();
        wake.set_nonblocking(false).unwrap();
        wake.set_read_timeout(Some(TIMEOUT)).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!((&wake).read(&mut byte).unwrap(), 1);
        wake.set_nonblocking(true).unwrap();
        drain_wakeups(&wake);

        let Request::Endpoints { reply } = request else {
            panic!("unexpected request");
        };
        reply.send(Ok(Vec::new())).unwrap();
        assert!(caller.join().unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_endpoint_ids() {
        assert_eq!(
            parse_endpoint_id("output:alsa_output.pci-0000_00_1f.3.analog-stereo"),
            Some((DeviceKind::Output, "alsa_output.pci-0000_00_1f.3.analog-stereo"))
        );
        assert_eq!(parse_endpoint_id("input:mic"), Some((DeviceKind::Input, "mic")));
        assert_eq!(parse_endpoint_id("mic"), None);
        assert_eq!(endpoint_id(DeviceKind::Input, "mic"), "input:mic");
    }
}
