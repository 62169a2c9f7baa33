//! Endpoint enumeration using the Windows MMDevice API.
//!
//! Provides COM initialization and endpoint lookup.

use windows::core::{Interface, PCWSTR, PWSTR};
use windows::Win32::Devices::Properties::DEVPKEY_Device_FriendlyName;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::Media::Audio::{
    eAll, eCapture, eConsole, eRender, EDataFlow, IMMDevice, IMMDeviceEnumerator, IMMEndpoint,
    MMDeviceEnumerator, DEVICE_STATE_ACTIVE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CoUninitialize, CLSCTX_ALL,
    COINIT_MULTITHREADED, STGM,
};
use windows::Win32::UI::Shell::PropertiesSystem::{IPropertyStore, PROPERTYKEY};

use crate::audio::{AudioError, DeviceDescriptor, DeviceKind, Result};

/// COM initialization guard that uninitializes COM on drop.
pub struct ComGuard {
    initialized: bool,
}

impl ComGuard {
    /// Join the multithreaded apartment for the current thread.
    ///
    /// Calls can come from any host thread; a thread that already entered a
    /// single-threaded apartment keeps it.
    pub fn new() -> Result<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            return Ok(Self { initialized: false });
        }
        hr.ok().map_err(AudioError::ComInitFailed)?;
        Ok(Self { initialized: true })
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.initialized {
            unsafe {
                CoUninitialize();
            }
        }
    }
}

/// Copy a COM-allocated wide string and free it.
pub(super) fn take_pwstr(value: PWSTR) -> Result<String> {
    if value.is_null() {
        return Ok(String::new());
    }
    let result = unsafe { value.to_string() };
    unsafe { CoTaskMemFree(Some(value.0 as *const _)) };
    result.map_err(|e| AudioError::Platform(format!("invalid UTF-16 string: {e}")))
}

fn data_flow(kind: DeviceKind) -> EDataFlow {
    match kind {
        DeviceKind::Output => eRender,
        DeviceKind::Input => eCapture,
        DeviceKind::All => eAll,
    }
}

/// Endpoint enumerator using the Windows MMDevice API.
///
/// Note: COM must be initialized on the calling thread.
pub struct DeviceEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl DeviceEnumerator {
    pub fn new() -> Result<Self> {
        unsafe {
            let enumerator: IMMDeviceEnumerator =
                CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                    .map_err(AudioError::WindowsError)?;
            Ok(Self { enumerator })
        }
    }

    /// Active endpoints for a direction.
    pub fn endpoints(&self, kind: DeviceKind) -> Result<Vec<DeviceDescriptor>> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(data_flow(kind), DEVICE_STATE_ACTIVE)
                .map_err(AudioError::WindowsError)?;
            let count = collection.GetCount().map_err(AudioError::WindowsError)?;

            let mut endpoints = Vec::with_capacity(count as usize);
            for i in 0..count {
                let device = collection.Item(i).map_err(AudioError::WindowsError)?;
                // Endpoints can vanish mid-enumeration
                if let Ok(desc) = describe(&device) {
                    endpoints.push(desc);
                }
            }
            Ok(endpoints)
        }
    }

    /// Id of the console-role default endpoint.
    pub fn default_device_id(&self, kind: DeviceKind) -> Result<Option<String>> {
        unsafe {
            let device = match self
                .enumerator
                .GetDefaultAudioEndpoint(data_flow(kind), eConsole)
            {
                Ok(d) => d,
                Err(_) => return Ok(None),
            };
            let id = take_pwstr(device.GetId().map_err(AudioError::WindowsError)?)?;
            Ok(Some(id))
        }
    }

    /// Look up an active endpoint by id.
    pub fn device(&self, device_id: &str) -> Result<IMMDevice> {
        let not_found = || AudioError::DeviceNotFound {
            device_id: device_id.to_string(),
        };
        unsafe {
            let device_id_wide: Vec<u16> =
                device_id.encode_utf16().chain(std::iter::once(0)).collect();
            let device = self
                .enumerator
                .GetDevice(PCWSTR::from_raw(device_id_wide.as_ptr()))
                .map_err(|_| not_found())?;
            if device.GetState().map_err(|_| not_found())? != DEVICE_STATE_ACTIVE {
                return Err(not_found());
            }
            Ok(device)
        }
    }
}

/// Build a descriptor from a live endpoint.
pub fn describe(device: &IMMDevice) -> Result<DeviceDescriptor> {
    unsafe {
        let id = take_pwstr(device.GetId().map_err(AudioError::WindowsError)?)?;

        let props: IPropertyStore = device
            .OpenPropertyStore(STGM(0))
            .map_err(AudioError::WindowsError)?;
        let name = friendly_name(&props).unwrap_or_else(|| "Unknown".to_string());

        let endpoint: IMMEndpoint = device.cast().map_err(AudioError::WindowsError)?;
        let flow = endpoint.GetDataFlow().map_err(AudioError::WindowsError)?;
        let kind = if flow == eCapture {
            DeviceKind::Input
        } else {
            DeviceKind::Output
        };

        Ok(DeviceDescriptor::new(id, name, kind))
    }
}

/// Get the friendly name of a device from its property store.
fn friendly_name(props: &IPropertyStore) -> Option<String> {
    unsafe {
        // Convert DEVPROPKEY to PROPERTYKEY
        let key = PROPERTYKEY {
            fmtid: DEVPKEY_Device_FriendlyName.fmtid,
            pid: DEVPKEY_Device_FriendlyName.pid,
        };
        let prop = props.GetValue(&key).ok()?;
        let s = prop.to_string();
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }
}
