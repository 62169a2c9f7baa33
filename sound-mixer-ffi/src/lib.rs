//! FFI bindings for Sound Mixer.
//!
//! This crate provides C ABI functions for a host scripting runtime. Data
//! crosses the boundary as UTF-8 JSON strings, failures as integer error
//! codes with a thread-local last error. All functions use
//! panic::catch_unwind to prevent Rust panics from unwinding across the FFI
//! boundary.
//!
//! Listener callbacks run wherever the engine's dispatch mode says: on the
//! thread that calls `sound_mixer_dispatch_pending` (queued, the default) or
//! directly on the platform notification thread (inline).

use serde::{Deserialize, Serialize};
use sound_mixer_rs::{
    platform_provider, AudioError, AudioProvider, Device, DeviceKind, DeviceRegistry, EventKind,
    HostContext, InlineContext, MemoryProvider, NotificationRecord, QueuedContext, Session,
    VolumeBalance,
};
use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Error Handling
// ============================================================================

/// Error codes returned by FFI functions.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    InvalidHandle = -1,
    InvalidArgument = -2,
    DeviceNotFound = -3,
    PlatformError = -4,
    JsonError = -5,
    StaleHandle = -6,
    Panic = -99,
}

impl From<&AudioError> for ErrorCode {
    fn from(err: &AudioError) -> Self {
        match err {
            AudioError::DeviceNotFound { .. }
            | AudioError::SessionNotFound { .. }
            | AudioError::NoDefaultDevice { .. } => ErrorCode::DeviceNotFound,
            AudioError::StaleHandle { .. } => ErrorCode::StaleHandle,
            AudioError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            _ => ErrorCode::PlatformError,
        }
    }
}

/// A failed call: the code handed to the host plus a readable message.
#[derive(Debug)]
struct FfiError {
    code: ErrorCode,
    message: String,
}

impl FfiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<AudioError> for FfiError {
    fn from(err: AudioError) -> Self {
        Self::new(ErrorCode::from(&err), err.to_string())
    }
}

impl From<serde_json::Error> for FfiError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::JsonError, err.to_string())
    }
}

type FfiResult<T> = Result<T, FfiError>;

/// Thread-local storage for the last error.
thread_local! {
    static LAST_ERROR: RefCell<Option<(ErrorCode, String)>> = const { RefCell::new(None) };
}

fn set_last_error(code: ErrorCode, message: impl Into<String>) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some((code, message.into()));
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Run `f` behind catch_unwind, recording any failure as the last error.
///
/// Returns `fallback` when `f` fails or panics.
fn guarded<T>(what: &str, fallback: T, f: impl FnOnce() -> FfiResult<T>) -> T {
    clear_last_error();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            debug!(call = what, code = ?err.code, message = %err.message, "FFI call failed");
            set_last_error(err.code, err.message);
            fallback
        }
        Err(_) => {
            set_last_error(ErrorCode::Panic, format!("Panic during {what}"));
            fallback
        }
    }
}

/// Integer flavour of [`guarded`]: the value on success, the negative error
/// code otherwise.
fn counted(what: &str, f: impl FnOnce() -> FfiResult<i64>) -> i64 {
    clear_last_error();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            debug!(call = what, code = ?err.code, message = %err.message, "FFI call failed");
            let code = err.code;
            set_last_error(code, err.message);
            code as i64
        }
        Err(_) => {
            set_last_error(ErrorCode::Panic, format!("Panic during {what}"));
            ErrorCode::Panic as i64
        }
    }
}

/// Status-code flavour of [`counted`].
fn status(what: &str, f: impl FnOnce() -> FfiResult<()>) -> i32 {
    counted(what, || f().map(|()| 0)) as i32
}

/// JSON-returning flavour of [`guarded`]; null on failure.
fn json_call<T: Serialize>(what: &str, f: impl FnOnce() -> FfiResult<T>) -> *mut c_char {
    guarded(what, ptr::null_mut(), || {
        let value = f()?;
        let json = serde_json::to_string(&value)?;
        Ok(alloc_c_string(&json))
    })
}

// ============================================================================
// Configuration
// ============================================================================

/// Audio backend selected at engine creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Platform,
    Memory,
}

/// Where listener callbacks run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// On the thread calling `sound_mixer_dispatch_pending`
    #[default]
    Queued,

    /// On the platform notification thread
    Inline,
}

fn two_channels() -> usize {
    2
}

/// A simulated endpoint for the memory backend.
#[derive(Debug, Deserialize)]
pub struct MemoryDeviceConfig {
    pub id: String,
    pub name: String,
    pub kind: String,
    #[serde(default = "two_channels")]
    pub channels: usize,
    #[serde(default)]
    pub default: bool,
}

/// Configuration for engine creation. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// tracing filter directive, e.g. "debug" or "sound_mixer_rs=trace"
    pub log_level: Option<String>,
    pub backend: BackendKind,
    pub dispatch: DispatchMode,

    /// Endpoints to seed when `backend` is "memory"
    pub devices: Vec<MemoryDeviceConfig>,
}

fn init_logging(level: &str) {
    // A subscriber installed by the host (or an earlier engine) wins
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .try_init();
}

// ============================================================================
// Data Types for JSON Serialization
// ============================================================================

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct BalanceDto {
    pub left: f32,
    pub right: f32,
    #[serde(default = "default_stereo")]
    pub stereo: bool,
}

fn default_stereo() -> bool {
    true
}

impl From<VolumeBalance> for BalanceDto {
    fn from(balance: VolumeBalance) -> Self {
        Self {
            left: balance.left,
            right: balance.right,
            stereo: balance.stereo,
        }
    }
}

impl From<BalanceDto> for VolumeBalance {
    fn from(dto: BalanceDto) -> Self {
        if dto.stereo {
            VolumeBalance::new(dto.left, dto.right)
        } else {
            VolumeBalance::mono()
        }
    }
}

/// A device with its current state.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceDto {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub volume: f32,
    pub muted: bool,
    pub balance: BalanceDto,
}

impl DeviceDto {
    fn read(device: &Device) -> FfiResult<Self> {
        let desc = device.descriptor();
        Ok(Self {
            id: desc.id,
            name: desc.name,
            kind: desc.kind.to_string(),
            volume: device.volume()?,
            muted: device.mute()?,
            balance: device.balance()?.into(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceDto>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceResponse {
    pub device: DeviceDto,
}

/// A per-application stream of a device.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionDto {
    pub id: String,
    pub device_id: String,
    pub display_name: String,
    pub process_path: String,
    pub state: String,
    pub volume: f32,
    pub muted: bool,
}

impl SessionDto {
    fn read(session: &Session) -> FfiResult<Self> {
        Ok(Self {
            id: session.id().to_string(),
            device_id: session.device_id().to_string(),
            display_name: session.display_name(),
            process_path: session.process_path(),
            state: session.state()?.to_string(),
            volume: session.volume()?,
            muted: session.mute()?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionDto>,
}

/// Payload handed to listener callbacks.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventDto {
    pub device_id: String,
    pub event: String,
    pub flags: u32,
    pub volume: f32,
    pub muted: bool,
}

// ============================================================================
// Engine Handle Type
// ============================================================================

/// Opaque handle to the engine. Actually points to an Engine struct.
pub type EngineHandle = *mut c_void;

/// Host callback receiving an event JSON string, valid for the call only.
pub type EventCallback = extern "C" fn(user_data: *mut c_void, event_json: *const c_char);

/// Called once when a listener is removed or its engine destroyed.
pub type ReleaseCallback = extern "C" fn(user_data: *mut c_void);

/// Internal engine state.
struct Engine {
    registry: DeviceRegistry,
    queue: Option<Arc<QueuedContext>>,
    memory: Option<MemoryProvider>,
}

impl Engine {
    fn new(config: EngineConfig) -> FfiResult<Self> {
        let mut memory = None;
        let provider: Arc<dyn AudioProvider> = match config.backend {
            BackendKind::Platform => platform_provider()?,
            BackendKind::Memory => {
                let provider = seeded_memory_provider(&config.devices)?;
                memory = Some(provider.clone());
                Arc::new(provider)
            }
        };

        let (context, queue) = match config.dispatch {
            DispatchMode::Queued => {
                let queue = QueuedContext::new();
                (queue.clone() as Arc<dyn HostContext>, Some(queue))
            }
            DispatchMode::Inline => (Arc::new(InlineContext) as Arc<dyn HostContext>, None),
        };

        info!(backend = provider.name(), dispatch = ?config.dispatch, "Engine created");
        Ok(Self {
            registry: DeviceRegistry::new(provider, context),
            queue,
            memory,
        })
    }

    fn device(&self, device_id: *const c_char) -> FfiResult<Arc<Device>> {
        Ok(self.registry.device(device_id_arg(device_id)?)?)
    }

    fn session(&self, device_id: *const c_char, session_id: *const c_char) -> FfiResult<Session> {
        let device = self.device(device_id)?;
        let id = unsafe { parse_c_str(session_id) }
            .ok_or_else(|| FfiError::new(ErrorCode::InvalidArgument, "Invalid session ID"))?;
        Ok(device.session(id)?)
    }
}

fn seeded_memory_provider(devices: &[MemoryDeviceConfig]) -> FfiResult<MemoryProvider> {
    let provider = MemoryProvider::new();
    for device in devices {
        let kind: DeviceKind = device.kind.parse()?;
        if kind == DeviceKind::All {
            return Err(FfiError::new(
                ErrorCode::InvalidArgument,
                format!("device '{}' needs kind output or input", device.id),
            ));
        }
        provider.add_endpoint_with_channels(&device.id, &device.name, kind, device.channels);
        if device.default {
            provider.set_default(kind, Some(&device.id));
        }
    }
    Ok(provider)
}

/// Host listener state; the release callback fires when this drops.
struct HostListener {
    callback: EventCallback,
    release: Option<ReleaseCallback>,
    user_data: *mut c_void,
}

// SAFETY: the host promises `user_data` may be used from whichever thread the
// engine's dispatch mode delivers on.
unsafe impl Send for HostListener {}
unsafe impl Sync for HostListener {}

impl HostListener {
    fn call(&self, json: &str) {
        if let Ok(json) = CString::new(json) {
            (self.callback)(self.user_data, json.as_ptr());
        }
    }
}

impl Drop for HostListener {
    fn drop(&mut self) {
        if let Some(release) = self.release {
            release(self.user_data);
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Allocate a C string from a Rust string. Caller must free with sound_mixer_free_string.
fn alloc_c_string(s: &str) -> *mut c_char {
    // Interior NULs cannot cross the boundary; drop them
    let bytes: Vec<u8> = s.bytes().filter(|b| *b != 0).collect();
    CString::new(bytes).map_or(ptr::null_mut(), CString::into_raw)
}

/// Parse a C string to a Rust string slice.
unsafe fn parse_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn device_id_arg<'a>(device_id: *const c_char) -> FfiResult<&'a str> {
    unsafe { parse_c_str(device_id) }
        .ok_or_else(|| FfiError::new(ErrorCode::InvalidArgument, "Invalid device ID"))
}

unsafe fn engine<'a>(handle: EngineHandle) -> FfiResult<&'a Engine> {
    (handle as *const Engine)
        .as_ref()
        .ok_or_else(|| FfiError::new(ErrorCode::InvalidHandle, "Invalid engine handle"))
}

fn device_kind(kind: u32) -> FfiResult<DeviceKind> {
    DeviceKind::from_index(kind).ok_or_else(|| {
        FfiError::new(ErrorCode::InvalidArgument, format!("Invalid device kind {kind}"))
    })
}

fn event_kind(kind: *const c_char) -> FfiResult<EventKind> {
    let kind = unsafe { parse_c_str(kind) }
        .ok_or_else(|| FfiError::new(ErrorCode::InvalidArgument, "Invalid event kind"))?;
    Ok(kind.parse()?)
}

fn write_out<T>(out: *mut T, value: T) -> FfiResult<()> {
    if out.is_null() {
        return Err(FfiError::new(ErrorCode::InvalidArgument, "Null output pointer"));
    }
    unsafe { out.write(value) };
    Ok(())
}

// ============================================================================
// FFI Functions - Lifecycle
// ============================================================================

/// Create a new engine instance.
///
/// # Arguments
/// * `config_json` - JSON [`EngineConfig`] (can be null for defaults)
///
/// # Returns
/// Handle to the engine, or null on failure. Check sound_mixer_last_error_code() on failure.
///
/// # Safety
/// The returned handle must be freed with sound_mixer_destroy().
#[no_mangle]
pub extern "C" fn sound_mixer_create(config_json: *const c_char) -> EngineHandle {
    guarded("engine creation", ptr::null_mut(), || {
        let config: EngineConfig = if config_json.is_null() {
            EngineConfig::default()
        } else {
            let json = unsafe { parse_c_str(config_json) }
                .ok_or_else(|| FfiError::new(ErrorCode::InvalidArgument, "Config is not UTF-8"))?;
            serde_json::from_str(json)?
        };
        if let Some(level) = config.log_level.as_deref() {
            init_logging(level);
        }

        let engine = Box::new(Engine::new(config)?);
        Ok(Box::into_raw(engine) as EngineHandle)
    })
}

/// Destroy an engine instance.
///
/// Every device it handed out goes stale and every listener is released.
///
/// # Safety
/// The handle must have been created by sound_mixer_create() and must not be used after this call.
#[no_mangle]
pub extern "C" fn sound_mixer_destroy(handle: EngineHandle) {
    if handle.is_null() {
        return;
    }

    let _ = panic::catch_unwind(|| unsafe {
        let _ = Box::from_raw(handle as *mut Engine);
    });
}

// ============================================================================
// FFI Functions - Devices
// ============================================================================

/// Get every active device.
///
/// # Returns
/// JSON [`DeviceListResponse`]. Caller must free with sound_mixer_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn sound_mixer_get_devices(handle: EngineHandle) -> *mut c_char {
    json_call("device enumeration", || {
        let engine = unsafe { engine(handle)? };
        let devices = engine
            .registry
            .devices()
            .iter()
            .map(|device| DeviceDto::read(device))
            .collect::<FfiResult<Vec<_>>>()?;
        Ok(DeviceListResponse { devices })
    })
}

/// Get the default device for a direction.
///
/// # Arguments
/// * `kind` - 0 = output, 1 = input
///
/// # Returns
/// JSON [`DeviceResponse`]. Caller must free with sound_mixer_free_string().
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn sound_mixer_get_default_device(handle: EngineHandle, kind: u32) -> *mut c_char {
    json_call("default device lookup", || {
        let engine = unsafe { engine(handle)? };
        let device = engine.registry.default_device(device_kind(kind)?)?;
        Ok(DeviceResponse {
            device: DeviceDto::read(&device)?,
        })
    })
}

// ============================================================================
// FFI Functions - Device Control
// ============================================================================

/// Read a device's master volume (0.0 to 1.0) into `out_volume`.
///
/// # Returns
/// 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn sound_mixer_get_device_volume(
    handle: EngineHandle,
    device_id: *const c_char,
    out_volume: *mut f32,
) -> i32 {
    status("get device volume", || {
        let engine = unsafe { engine(handle)? };
        let volume = engine.device(device_id)?.volume()?;
        write_out(out_volume, volume)
    })
}

/// Set a device's master volume. Values outside 0.0 to 1.0 are clamped.
///
/// # Returns
/// 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn sound_mixer_set_device_volume(
    handle: EngineHandle,
    device_id: *const c_char,
    volume: f32,
) -> i32 {
    status("set device volume", || {
        let engine = unsafe { engine(handle)? };
        Ok(engine.device(device_id)?.set_volume(volume)?)
    })
}

/// Read a device's mute state (1 = muted, 0 = unmuted) into `out_muted`.
#[no_mangle]
pub extern "C" fn sound_mixer_get_device_mute(
    handle: EngineHandle,
    device_id: *const c_char,
    out_muted: *mut i32,
) -> i32 {
    status("get device mute", || {
        let engine = unsafe { engine(handle)? };
        let muted = engine.device(device_id)?.mute()?;
        write_out(out_muted, muted as i32)
    })
}

/// Set a device's mute state (nonzero = muted).
#[no_mangle]
pub extern "C" fn sound_mixer_set_device_mute(
    handle: EngineHandle,
    device_id: *const c_char,
    muted: i32,
) -> i32 {
    status("set device mute", || {
        let engine = unsafe { engine(handle)? };
        Ok(engine.device(device_id)?.set_mute(muted != 0)?)
    })
}

/// Flip a device's mute state, writing the new state into `out_muted` (may be null).
#[no_mangle]
pub extern "C" fn sound_mixer_toggle_device_mute(
    handle: EngineHandle,
    device_id: *const c_char,
    out_muted: *mut i32,
) -> i32 {
    status("toggle device mute", || {
        let engine = unsafe { engine(handle)? };
        let muted = engine.device(device_id)?.toggle_mute()?;
        if !out_muted.is_null() {
            write_out(out_muted, muted as i32)?;
        }
        Ok(())
    })
}

/// Get a device's stereo balance.
///
/// # Returns
/// JSON [`BalanceDto`]; `stereo` is false for devices with fewer than two
/// channels. Caller must free with sound_mixer_free_string().
#[no_mangle]
pub extern "C" fn sound_mixer_get_device_balance(
    handle: EngineHandle,
    device_id: *const c_char,
) -> *mut c_char {
    json_call("get device balance", || {
        let engine = unsafe { engine(handle)? };
        Ok(BalanceDto::from(engine.device(device_id)?.balance()?))
    })
}

/// Set a device's stereo balance from a JSON [`BalanceDto`].
///
/// A balance with a channel at or outside 0.0/1.0, or a mono device, leaves
/// the device unchanged and still returns success.
#[no_mangle]
pub extern "C" fn sound_mixer_set_device_balance(
    handle: EngineHandle,
    device_id: *const c_char,
    balance_json: *const c_char,
) -> i32 {
    status("set device balance", || {
        let engine = unsafe { engine(handle)? };
        let json = unsafe { parse_c_str(balance_json) }
            .ok_or_else(|| FfiError::new(ErrorCode::InvalidArgument, "Invalid balance JSON"))?;
        let balance: BalanceDto = serde_json::from_str(json)?;
        Ok(engine.device(device_id)?.set_balance(balance.into())?)
    })
}

// ============================================================================
// FFI Functions - Sessions
// ============================================================================

/// Get the per-application sessions of a device.
///
/// # Returns
/// JSON [`SessionListResponse`]. Caller must free with sound_mixer_free_string().
#[no_mangle]
pub extern "C" fn sound_mixer_get_sessions(
    handle: EngineHandle,
    device_id: *const c_char,
) -> *mut c_char {
    json_call("session enumeration", || {
        let engine = unsafe { engine(handle)? };
        let sessions = engine
            .device(device_id)?
            .sessions()?
            .iter()
            .map(SessionDto::read)
            .collect::<FfiResult<Vec<_>>>()?;
        Ok(SessionListResponse { sessions })
    })
}

#[no_mangle]
pub extern "C" fn sound_mixer_get_session_volume(
    handle: EngineHandle,
    device_id: *const c_char,
    session_id: *const c_char,
    out_volume: *mut f32,
) -> i32 {
    status("get session volume", || {
        let engine = unsafe { engine(handle)? };
        let volume = engine.session(device_id, session_id)?.volume()?;
        write_out(out_volume, volume)
    })
}

#[no_mangle]
pub extern "C" fn sound_mixer_set_session_volume(
    handle: EngineHandle,
    device_id: *const c_char,
    session_id: *const c_char,
    volume: f32,
) -> i32 {
    status("set session volume", || {
        let engine = unsafe { engine(handle)? };
        Ok(engine.session(device_id, session_id)?.set_volume(volume)?)
    })
}

#[no_mangle]
pub extern "C" fn sound_mixer_get_session_mute(
    handle: EngineHandle,
    device_id: *const c_char,
    session_id: *const c_char,
    out_muted: *mut i32,
) -> i32 {
    status("get session mute", || {
        let engine = unsafe { engine(handle)? };
        let muted = engine.session(device_id, session_id)?.mute()?;
        write_out(out_muted, muted as i32)
    })
}

#[no_mangle]
pub extern "C" fn sound_mixer_set_session_mute(
    handle: EngineHandle,
    device_id: *const c_char,
    session_id: *const c_char,
    muted: i32,
) -> i32 {
    status("set session mute", || {
        let engine = unsafe { engine(handle)? };
        Ok(engine.session(device_id, session_id)?.set_mute(muted != 0)?)
    })
}

// ============================================================================
// FFI Functions - Events
// ============================================================================

/// Register a listener for "volume" or "mute" changes of a device.
///
/// `callback` receives `user_data` and an [`EventDto`] JSON string that is
/// only valid during the call. `release` (may be null) is called exactly once
/// with `user_data` when the listener is removed or the engine destroyed.
///
/// # Returns
/// The listener handle (>= 0), or a negative error code.
#[no_mangle]
pub extern "C" fn sound_mixer_on(
    handle: EngineHandle,
    device_id: *const c_char,
    kind: *const c_char,
    callback: Option<EventCallback>,
    release: Option<ReleaseCallback>,
    user_data: *mut c_void,
) -> i64 {
    counted("listener registration", || {
        let engine = unsafe { engine(handle)? };
        let kind = event_kind(kind)?;
        let device = engine.device(device_id)?;
        let callback = callback
            .ok_or_else(|| FfiError::new(ErrorCode::InvalidArgument, "Null callback"))?;

        let host = HostListener {
            callback,
            release,
            user_data,
        };
        let id = device.id().to_string();
        let listener = Box::new(move |record: &NotificationRecord| {
            let event = EventDto {
                device_id: id.clone(),
                event: kind.to_string(),
                flags: record.flags.bits(),
                volume: record.volume,
                muted: record.muted,
            };
            if let Ok(json) = serde_json::to_string(&event) {
                host.call(&json);
            }
        });
        Ok(engine.registry.on(&device, kind, listener) as i64)
    })
}

/// Remove one listener.
///
/// Works after the device was unplugged, so hosts can still release the
/// listeners of a retired device.
///
/// # Returns
/// 1 if it was registered, 0 if not, negative error code on failure.
#[no_mangle]
pub extern "C" fn sound_mixer_off(
    handle: EngineHandle,
    device_id: *const c_char,
    kind: *const c_char,
    listener: u64,
) -> i32 {
    counted("listener removal", || {
        let engine = unsafe { engine(handle)? };
        let kind = event_kind(kind)?;
        let id = device_id_arg(device_id)?;
        Ok(engine.registry.off_by_id(id, kind, listener) as i64)
    }) as i32
}

/// Remove every listener of one kind for a device, unplugged ones included.
///
/// Fails with DeviceNotFound for ids the engine never opened.
#[no_mangle]
pub extern "C" fn sound_mixer_remove_all_listeners(
    handle: EngineHandle,
    device_id: *const c_char,
    kind: *const c_char,
) -> i32 {
    status("listener removal", || {
        let engine = unsafe { engine(handle)? };
        let kind = event_kind(kind)?;
        let id = device_id_arg(device_id)?;
        if engine.registry.remove_all_listeners_by_id(id, kind) {
            Ok(())
        } else {
            Err(AudioError::DeviceNotFound {
                device_id: id.to_string(),
            }
            .into())
        }
    })
}

/// Run queued listener callbacks on the calling thread.
///
/// # Returns
/// Number of callbacks run (always 0 in inline mode), or a negative error code.
#[no_mangle]
pub extern "C" fn sound_mixer_dispatch_pending(handle: EngineHandle) -> i32 {
    counted("dispatch", || {
        let engine = unsafe { engine(handle)? };
        let ran = engine.queue.as_ref().map_or(0, |queue| queue.run_pending());
        Ok(ran.min(i32::MAX as usize) as i64)
    }) as i32
}

/// Simulate a change made outside this process on a memory-backend device.
///
/// Listeners are notified as for a real platform change. Fails with
/// InvalidArgument on any other backend.
#[no_mangle]
pub extern "C" fn sound_mixer_simulate_change(
    handle: EngineHandle,
    device_id: *const c_char,
    volume: f32,
    muted: i32,
) -> i32 {
    status("simulated change", || {
        let engine = unsafe { engine(handle)? };
        let memory = engine.memory.as_ref().ok_or_else(|| {
            FfiError::new(ErrorCode::InvalidArgument, "Engine does not use the memory backend")
        })?;
        let id = unsafe { parse_c_str(device_id) }
            .ok_or_else(|| FfiError::new(ErrorCode::InvalidArgument, "Invalid device ID"))?;
        Ok(memory.external_change(id, volume, muted != 0)?)
    })
}

// ============================================================================
// FFI Functions - Memory Management
// ============================================================================

/// Free a string allocated by this library.
///
/// # Safety
/// The pointer must have been returned by one of the sound_mixer_* functions.
/// Do not call this on strings from other sources.
#[no_mangle]
pub extern "C" fn sound_mixer_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }

    let _ = panic::catch_unwind(|| unsafe {
        let _ = CString::from_raw(ptr);
    });
}

// ============================================================================
// FFI Functions - Error Handling
// ============================================================================

/// Get the last error code.
///
/// # Returns
/// The error code from the last failed operation on this thread, or 0 if no error.
#[no_mangle]
pub extern "C" fn sound_mixer_last_error_code() -> i32 {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|(code, _)| *code as i32)
            .unwrap_or(0)
    })
}

/// Get the last error message.
///
/// # Returns
/// Error message string. Caller must free with sound_mixer_free_string().
/// Returns null if no error.
#[no_mangle]
pub extern "C" fn sound_mixer_last_error_message() -> *mut c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|(_, msg)| alloc_c_string(msg))
            .unwrap_or(ptr::null_mut())
    })
}

// ============================================================================
// FFI Functions - Utility
// ============================================================================

/// Get the library version.
///
/// # Returns
/// Version string. Caller must free with sound_mixer_free_string().
#[no_mangle]
pub extern "C" fn sound_mixer_version() -> *mut c_char {
    alloc_c_string(env!("CARGO_PKG_VERSION"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sound_mixer_rs::platform::memory::SessionSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const CONFIG: &str = r#"{
        "backend": "memory",
        "devices": [
            {"id": "spk", "name": "Speakers", "kind": "output", "default": true},
            {"id": "mic", "name": "Microphone", "kind": "input", "channels": 1}
        ]
    }"#;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    fn create(config: &str) -> EngineHandle {
        let config = c(config);
        let handle = sound_mixer_create(config.as_ptr());
        assert!(!handle.is_null(), "engine creation failed");
        handle
    }

    fn take_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let s = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        sound_mixer_free_string(ptr);
        s
    }

    fn memory(handle: EngineHandle) -> MemoryProvider {
        unsafe { engine(handle) }.unwrap().memory.clone().unwrap()
    }

    /// Shared between a test and its callbacks through `user_data`.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<EventDto>>,
        released: AtomicUsize,
    }

    extern "C" fn record_event(user_data: *mut c_void, json: *const c_char) {
        let recorder = unsafe { &*(user_data as *const Recorder) };
        let json = unsafe { CStr::from_ptr(json) }.to_str().unwrap();
        recorder
            .events
            .lock()
            .unwrap()
            .push(serde_json::from_str(json).unwrap());
    }

    extern "C" fn record_release(user_data: *mut c_void) {
        let recorder = unsafe { &*(user_data as *const Recorder) };
        recorder.released.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(
            ErrorCode::from(&AudioError::DeviceNotFound {
                device_id: "test".to_string()
            }),
            ErrorCode::DeviceNotFound
        );
        assert_eq!(
            ErrorCode::from(&AudioError::StaleHandle {
                device_id: "test".to_string()
            }),
            ErrorCode::StaleHandle
        );
        assert_eq!(
            ErrorCode::from(&AudioError::Platform("boom".to_string())),
            ErrorCode::PlatformError
        );
    }

    #[test]
    fn test_engine_lifecycle() {
        let handle = create(r#"{"backend": "memory"}"#);
        let json = take_string(sound_mixer_get_devices(handle));
        let list: DeviceListResponse = serde_json::from_str(&json).unwrap();
        assert!(list.devices.is_empty());
        sound_mixer_destroy(handle);
    }

    #[test]
    fn test_bad_config_is_json_error() {
        let config = c("{not json");
        assert!(sound_mixer_create(config.as_ptr()).is_null());
        assert_eq!(sound_mixer_last_error_code(), ErrorCode::JsonError as i32);
        let message = take_string(sound_mixer_last_error_message());
        assert!(!message.is_empty());
    }

    #[test]
    fn test_null_handle() {
        let id = c("spk");
        let mut volume = 0.0f32;
        assert_eq!(
            sound_mixer_get_device_volume(ptr::null_mut(), id.as_ptr(), &mut volume),
            ErrorCode::InvalidHandle as i32
        );
        assert!(sound_mixer_get_devices(ptr::null_mut()).is_null());
        assert_eq!(sound_mixer_last_error_code(), ErrorCode::InvalidHandle as i32);
    }

    #[test]
    fn test_devices_and_default() {
        let handle = create(CONFIG);

        let list: DeviceListResponse =
            serde_json::from_str(&take_string(sound_mixer_get_devices(handle))).unwrap();
        let ids: Vec<_> = list.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["spk", "mic"]);
        assert!(!list.devices[1].balance.stereo);

        let default: DeviceResponse =
            serde_json::from_str(&take_string(sound_mixer_get_default_device(handle, 0))).unwrap();
        assert_eq!(default.device.name, "Speakers");

        assert!(sound_mixer_get_default_device(handle, 1).is_null());
        assert_eq!(sound_mixer_last_error_code(), ErrorCode::DeviceNotFound as i32);
        assert!(sound_mixer_get_default_device(handle, 2).is_null());
        assert_eq!(sound_mixer_last_error_code(), ErrorCode::InvalidArgument as i32);

        sound_mixer_destroy(handle);
    }

    #[test]
    fn test_volume_and_mute() {
        let handle = create(CONFIG);
        let id = c("spk");

        assert_eq!(sound_mixer_set_device_volume(handle, id.as_ptr(), 1.7), 0);
        let mut volume = 0.0f32;
        assert_eq!(sound_mixer_get_device_volume(handle, id.as_ptr(), &mut volume), 0);
        assert_eq!(volume, 1.0);

        let mut muted = -1;
        assert_eq!(sound_mixer_toggle_device_mute(handle, id.as_ptr(), &mut muted), 0);
        assert_eq!(muted, 1);
        assert_eq!(sound_mixer_set_device_mute(handle, id.as_ptr(), 0), 0);
        assert_eq!(sound_mixer_get_device_mute(handle, id.as_ptr(), &mut muted), 0);
        assert_eq!(muted, 0);

        let missing = c("nope");
        assert_eq!(
            sound_mixer_set_device_volume(handle, missing.as_ptr(), 0.5),
            ErrorCode::DeviceNotFound as i32
        );
        sound_mixer_destroy(handle);
    }

    #[test]
    fn test_balance() {
        let handle = create(CONFIG);
        let id = c("spk");

        let balance = c(r#"{"left": 0.25, "right": 0.75}"#);
        assert_eq!(sound_mixer_set_device_balance(handle, id.as_ptr(), balance.as_ptr()), 0);
        let read: BalanceDto =
            serde_json::from_str(&take_string(sound_mixer_get_device_balance(handle, id.as_ptr())))
                .unwrap();
        assert_eq!(read, BalanceDto { left: 0.25, right: 0.75, stereo: true });

        // Boundary values are ignored
        let full_left = c(r#"{"left": 1.0, "right": 0.5}"#);
        assert_eq!(sound_mixer_set_device_balance(handle, id.as_ptr(), full_left.as_ptr()), 0);
        let read: BalanceDto =
            serde_json::from_str(&take_string(sound_mixer_get_device_balance(handle, id.as_ptr())))
                .unwrap();
        assert_eq!(read.left, 0.25);

        let bad = c("[1, 2]");
        assert_eq!(
            sound_mixer_set_device_balance(handle, id.as_ptr(), bad.as_ptr()),
            ErrorCode::JsonError as i32
        );
        sound_mixer_destroy(handle);
    }

    #[test]
    fn test_sessions() {
        let handle = create(CONFIG);
        memory(handle)
            .add_session(
                "spk",
                SessionSpec::new("player", "Player", "/usr/bin/player"),
            )
            .unwrap();
        let device = c("spk");
        let session = c("player");

        let json = take_string(sound_mixer_get_sessions(handle, device.as_ptr()));
        let list: SessionListResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(list.sessions.len(), 1);
        assert_eq!(list.sessions[0].display_name, "Player");

        assert_eq!(
            sound_mixer_set_session_volume(handle, device.as_ptr(), session.as_ptr(), 0.3),
            0
        );
        let mut volume = 0.0f32;
        assert_eq!(
            sound_mixer_get_session_volume(handle, device.as_ptr(), session.as_ptr(), &mut volume),
            0
        );
        assert!((volume - 0.3).abs() < 1e-4);

        assert_eq!(sound_mixer_set_session_mute(handle, device.as_ptr(), session.as_ptr(), 1), 0);
        let mut muted = 0;
        assert_eq!(
            sound_mixer_get_session_mute(handle, device.as_ptr(), session.as_ptr(), &mut muted),
            0
        );
        assert_eq!(muted, 1);

        let missing = c("ghost");
        assert_eq!(
            sound_mixer_set_session_mute(handle, device.as_ptr(), missing.as_ptr(), 1),
            ErrorCode::DeviceNotFound as i32
        );
        sound_mixer_destroy(handle);
    }

    #[test]
    fn test_listener_roundtrip() {
        let handle = create(CONFIG);
        let recorder = Box::new(Recorder::default());
        let user_data = &*recorder as *const Recorder as *mut c_void;
        let id = c("spk");
        let volume = c("volume");
        let mute = c("mute");

        let l = sound_mixer_on(
            handle,
            id.as_ptr(),
            volume.as_ptr(),
            Some(record_event),
            Some(record_release),
            user_data,
        );
        let m = sound_mixer_on(
            handle,
            id.as_ptr(),
            mute.as_ptr(),
            Some(record_event),
            Some(record_release),
            user_data,
        );
        assert_eq!((l, m), (0, 1));

        assert_eq!(sound_mixer_simulate_change(handle, id.as_ptr(), 0.25, 0), 0);
        assert!(recorder.events.lock().unwrap().is_empty());
        assert_eq!(sound_mixer_dispatch_pending(handle), 1);
        {
            let events = recorder.events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].event, "volume");
            assert_eq!(events[0].device_id, "spk");
            assert_eq!(events[0].flags, 2);
        }

        assert_eq!(sound_mixer_off(handle, id.as_ptr(), volume.as_ptr(), 0), 1);
        assert_eq!(sound_mixer_off(handle, id.as_ptr(), volume.as_ptr(), 0), 0);
        assert_eq!(recorder.released.load(Ordering::SeqCst), 1);

        assert_eq!(sound_mixer_simulate_change(handle, id.as_ptr(), 0.75, 0), 0);
        assert_eq!(sound_mixer_dispatch_pending(handle), 0);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);

        // Destroying the engine releases the remaining listener
        sound_mixer_destroy(handle);
        assert_eq!(recorder.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listeners_released_after_unplug() {
        let handle = create(CONFIG);
        let recorder = Box::new(Recorder::default());
        let user_data = &*recorder as *const Recorder as *mut c_void;
        let id = c("spk");
        let volume = c("volume");
        let mute = c("mute");

        for kind in [&volume, &mute] {
            sound_mixer_on(
                handle,
                id.as_ptr(),
                kind.as_ptr(),
                Some(record_event),
                Some(record_release),
                user_data,
            );
        }

        assert!(memory(handle).remove_endpoint("spk"));
        let list: DeviceListResponse =
            serde_json::from_str(&take_string(sound_mixer_get_devices(handle))).unwrap();
        assert!(list.devices.iter().all(|d| d.id != "spk"));

        assert_eq!(sound_mixer_off(handle, id.as_ptr(), volume.as_ptr(), 0), 1);
        assert_eq!(recorder.released.load(Ordering::SeqCst), 1);
        assert_eq!(sound_mixer_remove_all_listeners(handle, id.as_ptr(), mute.as_ptr()), 0);
        assert_eq!(recorder.released.load(Ordering::SeqCst), 2);

        let ghost = c("ghost");
        assert_eq!(sound_mixer_off(handle, ghost.as_ptr(), volume.as_ptr(), 0), 0);
        assert_eq!(
            sound_mixer_remove_all_listeners(handle, ghost.as_ptr(), mute.as_ptr()),
            ErrorCode::DeviceNotFound as i32
        );
        sound_mixer_destroy(handle);
    }

    #[test]
    fn test_inline_dispatch() {
        let handle = create(r#"{"backend": "memory", "dispatch": "inline",
            "devices": [{"id": "spk", "name": "Speakers", "kind": "output"}]}"#);
        let recorder = Box::new(Recorder::default());
        let user_data = &*recorder as *const Recorder as *mut c_void;
        let id = c("spk");
        let mute = c("mute");

        let listener = sound_mixer_on(
            handle,
            id.as_ptr(),
            mute.as_ptr(),
            Some(record_event),
            None,
            user_data,
        );
        assert_eq!(listener, 0);
        assert_eq!(sound_mixer_set_device_mute(handle, id.as_ptr(), 1), 0);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
        assert!(recorder.events.lock().unwrap()[0].muted);
        assert_eq!(sound_mixer_dispatch_pending(handle), 0);

        assert_eq!(sound_mixer_remove_all_listeners(handle, id.as_ptr(), mute.as_ptr()), 0);
        assert_eq!(sound_mixer_set_device_mute(handle, id.as_ptr(), 0), 0);
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
        sound_mixer_destroy(handle);
    }

    #[test]
    fn test_unknown_event_kind() {
        let handle = create(CONFIG);
        let id = c("spk");
        let kind = c("balance");
        let result = sound_mixer_on(
            handle,
            id.as_ptr(),
            kind.as_ptr(),
            Some(record_event),
            None,
            ptr::null_mut(),
        );
        assert_eq!(result, ErrorCode::InvalidArgument as i64);
        assert_eq!(sound_mixer_last_error_code(), ErrorCode::InvalidArgument as i32);
        sound_mixer_destroy(handle);
    }

    #[test]
    fn test_version() {
        let version = take_string(sound_mixer_version());
        assert!(!version.is_empty());
    }
}
