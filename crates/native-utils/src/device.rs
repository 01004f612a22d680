use anyhow::{Context, Result, anyhow};
use cpal::Device;
use cpal::traits::{DeviceTrait, HostTrait};

fn get_host() -> cpal::Host {
    cpal::default_host()
}

/// Finds the named input device, or the host default when no name is given.
pub fn get_or_default_input(device_name: Option<&str>) -> Result<Device> {
    let host = get_host();
    tracing::debug!("Host: {:?}", host.id());

    let Some(target) = device_name else {
        return host
            .default_input_device()
            .context("No default input device");
    };

    host.input_devices()
        .context("Failed to enumerate input devices")?
        .find(|device| device.name().is_ok_and(|name| name == target))
        .ok_or_else(|| anyhow!("No input device named {target:?}"))
}

/// One line per input device: name, channels, sample rate, default marker.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = get_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let devices = host
        .input_devices()
        .context("Failed to enumerate input devices")?;

    Ok(devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_input_config().ok()?;
            Some(describe(&name, config.channels(), config.sample_rate().0, default_name.as_deref()))
        })
        .collect())
}

pub fn list_output_devices() -> Result<Vec<String>> {
    let host = get_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let devices = host
        .output_devices()
        .context("Failed to enumerate output devices")?;

    Ok(devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_output_config().ok()?;
            Some(describe(&name, config.channels(), config.sample_rate().0, default_name.as_deref()))
        })
        .collect())
}

fn describe(name: &str, channels: u16, sample_rate: u32, default_name: Option<&str>) -> String {
    let mut line = format!(" * {}({}ch, {}hz)", name, channels, sample_rate);
    if default_name == Some(name) {
        line.push_str(" [default]");
    }
    line
}
