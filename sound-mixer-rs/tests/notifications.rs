//! End-to-end notification scenarios against the in-memory backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use sound_mixer_rs::{
    DeviceKind, DeviceRegistry, EventKind, InlineContext, MemoryProvider, NotificationFlags,
    NotificationRecord, QueuedContext,
};

fn provider_with(ids: &[&str]) -> MemoryProvider {
    let provider = MemoryProvider::new();
    for id in ids {
        provider.add_endpoint(id, &format!("Device {id}"), DeviceKind::Output);
    }
    provider
}

type Recorded = Arc<Mutex<Vec<NotificationRecord>>>;

fn recorder() -> (Recorded, Box<dyn Fn(&NotificationRecord) + Send + Sync>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, Box::new(move |record| sink.lock().push(*record)))
}

#[test]
fn test_volume_listener_lifecycle() {
    let provider = provider_with(&["A"]);
    let context = QueuedContext::new();
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), context.clone());
    let device = registry.device("A").unwrap();

    let (volume_seen, l) = recorder();
    let (mute_seen, m) = recorder();
    assert_eq!(registry.on(&device, EventKind::Volume, l), 0);
    assert_eq!(registry.on(&device, EventKind::Mute, m), 1);

    provider.external_change("A", 0.5, false).unwrap();
    assert_eq!(context.run_pending(), 1);
    {
        let seen = volume_seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].flags, NotificationFlags::VOLUME);
        assert_eq!(seen[0].volume, 0.5);
    }
    assert!(mute_seen.lock().is_empty());

    assert!(registry.off(&device, EventKind::Volume, 0));
    assert!(!registry.off(&device, EventKind::Volume, 0));

    provider.external_change("A", 0.25, false).unwrap();
    assert_eq!(context.run_pending(), 0);
    assert_eq!(volume_seen.lock().len(), 1);
}

#[test]
fn test_mute_only_change_skips_volume_listeners() {
    let provider = provider_with(&["A"]);
    let context = QueuedContext::new();
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), context.clone());
    let device = registry.device("A").unwrap();

    provider.external_change("A", 0.5, false).unwrap();
    context.run_pending();

    let (volume_seen, l) = recorder();
    let (mute_seen, m) = recorder();
    registry.on(&device, EventKind::Volume, l);
    registry.on(&device, EventKind::Mute, m);

    provider.external_change("A", 0.5, true).unwrap();
    context.run_pending();

    assert!(volume_seen.lock().is_empty());
    let seen = mute_seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].flags, NotificationFlags::MUTE);
    assert!(seen[0].muted);
}

#[test]
fn test_removal_before_drain_suppresses_delivery() {
    let provider = provider_with(&["A"]);
    let context = QueuedContext::new();
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), context.clone());
    let device = registry.device("A").unwrap();

    let (seen, l) = recorder();
    let handle = registry.on(&device, EventKind::Volume, l);
    provider.external_change("A", 0.3, false).unwrap();
    assert_eq!(context.pending(), 1);

    assert!(registry.off(&device, EventKind::Volume, handle));
    context.run_pending();
    assert!(seen.lock().is_empty());
}

#[test]
fn test_enumeration_does_not_swallow_late_callbacks() {
    let provider = provider_with(&["A"]);
    provider.defer_notifications(true);
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), Arc::new(InlineContext));
    let device = registry.device("A").unwrap();
    let (seen, l) = recorder();
    registry.on(&device, EventKind::Volume, l);

    provider.external_change("A", 0.3, false).unwrap();
    assert_eq!(registry.devices().len(), 1);
    assert_eq!(provider.deliver_pending(), 1);

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].flags, NotificationFlags::VOLUME);
    assert_eq!(seen[0].volume, 0.3);
}

#[test]
fn test_late_callback_without_enumeration_fires_once() {
    let provider = provider_with(&["A"]);
    provider.defer_notifications(true);
    let context = QueuedContext::new();
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), context.clone());
    let device = registry.device("A").unwrap();
    let (seen, l) = recorder();
    registry.on(&device, EventKind::Volume, l);

    provider.external_change("A", 0.3, false).unwrap();
    assert_eq!(context.run_pending(), 0);
    provider.deliver_pending();
    assert_eq!(context.run_pending(), 1);
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_unplugged_device_goes_stale() {
    let provider = provider_with(&["A", "B"]);
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), Arc::new(InlineContext));
    let devices = registry.devices();
    assert_eq!(devices.len(), 2);
    let a = Arc::clone(&devices[0]);
    assert_eq!(provider.subscriber_count("A"), 1);

    assert!(provider.remove_endpoint("A"));
    let remaining = registry.devices();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), "B");

    assert!(!a.is_valid());
    assert!(!a.update());
    assert!(a.volume().unwrap_err().is_stale());
    assert_eq!(provider.subscriber_count("A"), 0);
}

#[test]
fn test_instances_are_stable_across_enumerations() {
    let provider = provider_with(&["A", "B"]);
    let registry = DeviceRegistry::new(Arc::new(provider), Arc::new(InlineContext));

    let first = registry.devices();
    let second = registry.devices();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert!(Arc::ptr_eq(a, b));
    }
}

#[test]
fn test_no_endpoints_is_empty_not_error() {
    let registry = DeviceRegistry::new(Arc::new(MemoryProvider::new()), Arc::new(InlineContext));
    assert!(registry.devices().is_empty());
}

#[test]
fn test_listeners_survive_rename() {
    let provider = provider_with(&["A"]);
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), Arc::new(InlineContext));
    let device = registry.device("A").unwrap();

    let (seen, l) = recorder();
    registry.on(&device, EventKind::Volume, l);

    provider.rename_endpoint("A", "Living Room").unwrap();
    let devices = registry.devices();
    assert!(Arc::ptr_eq(&devices[0], &device));
    assert_eq!(device.descriptor().name, "Living Room");

    provider.external_change("A", 0.4, false).unwrap();
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_panicking_listener_is_isolated() {
    let provider = provider_with(&["A"]);
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), Arc::new(InlineContext));
    let device = registry.device("A").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    registry.on(&device, EventKind::Volume, Box::new(|_| panic!("listener failure")));
    registry.on(
        &device,
        EventKind::Volume,
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    provider.external_change("A", 0.2, false).unwrap();
    provider.external_change("A", 0.6, false).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_changes_from_another_thread_run_on_the_host_thread() {
    let provider = provider_with(&["A"]);
    let context = QueuedContext::new();
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), context.clone());
    let device = registry.device("A").unwrap();

    let host = thread::current().id();
    let delivered_on = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered_on);
    registry.on(
        &device,
        EventKind::Volume,
        Box::new(move |_| sink.lock().push(thread::current().id())),
    );

    let platform = provider.clone();
    thread::spawn(move || platform.external_change("A", 0.1, false).unwrap())
        .join()
        .unwrap();

    assert!(delivered_on.lock().is_empty());
    assert_eq!(context.run_pending(), 1);
    assert_eq!(*delivered_on.lock(), vec![host]);
}

#[test]
fn test_registry_drop_releases_everything() {
    let provider = provider_with(&["A"]);
    let registry = DeviceRegistry::new(Arc::new(provider.clone()), Arc::new(InlineContext));
    let device = registry.device("A").unwrap();
    let (_seen, l) = recorder();
    registry.on(&device, EventKind::Mute, l);
    let events = Arc::clone(registry.events());

    drop(registry);
    assert!(!device.is_valid());
    assert!(events.is_empty());
    assert_eq!(provider.subscriber_count("A"), 0);
}
