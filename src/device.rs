//! A stove as seen through the cloud.
//!
//! A [`Device`] combines the register map fetched at discovery with the latest
//! buffer snapshot. Reads are synchronous projections of that snapshot; only
//! [`Device::update_mapping`], [`Device::update`] and the setters talk to the
//! cloud.

use crate::api::{
    self, BufferAnswer, BufferReadingRequest, DeviceEntry, JobRequestResponse, RegistersMapRequest,
    RegistersMapResponse, WireId, WriteRequest,
};
use crate::buffer::{BufferState, Quirks};
use crate::formula::Number;
use crate::job::{self, JobAnswer, ReadPolicy, WritePolicy};
use crate::register::{RegisterDescriptor, RegisterMap};
use crate::session::SessionManager;
use crate::transport::Method;
use crate::{Error, Result};
use log::{debug, error, info};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Language `enc_val` lookups fall back to.
pub const DEFAULT_LANGUAGE: &str = "ENG";
/// Register only present on stoves that burn wood as well as pellets.
pub const HYBRID_REGISTER: &str = WOOD_POWER_REGISTER;
/// Pellet power level register.
pub const POWER_REGISTER: &str = "power_set";
/// Wood power level register of hybrid stoves.
pub const WOOD_POWER_REGISTER: &str = "power_wood_set";
/// Gate that reports a hybrid stove burning wood.
pub const WOOD_ACTIVE_REGISTER: &str = "real_power_wood_get";
/// Register switching the stove on and off by label.
pub const STATUS_MANAGED_REGISTER: &str = "status_managed_get";
/// `status_get` labels of a stove that is not heating.
pub const STATUS_OFF: [&str; 6] = ["OFF", "FINAL CLEANING", "STOP", "SHUT OFF", "0", "6"];
/// Key infixes of air temperature registers, in probing order.
pub const AIR_VARIANTS: [&str; 3] = ["air", "air2", "air_palm"];
/// Key infixes of water temperature registers, in probing order.
pub const WATER_VARIANTS: [&str; 3] = ["water", "h2o", "h2o_mandata"];

/// A register together with its current value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterReading {
    #[serde(flatten)]
    pub descriptor: RegisterDescriptor,
    /// Buffer word at the register offset, masked.
    pub value_raw: i64,
    pub value: Number,
}

/// Human readable form of a register value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueDescription {
    /// Localized `enc_val` label.
    Label(String),
    /// Value without a label.
    Value(Number),
}

impl fmt::Display for ValueDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueDescription::Label(label) => f.write_str(label),
            ValueDescription::Value(value) => write!(f, "{value}"),
        }
    }
}

/// Fuel a hybrid stove is burning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HybridMode {
    Pellet,
    Wood,
}

impl fmt::Display for HybridMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HybridMode::Pellet => "Pellet",
            HybridMode::Wood => "Wood",
        })
    }
}

/// Wall clock fields written by [`Device::sync_clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    pub hour: u32,
    pub minute: u32,
    pub day: u32,
    pub month: u32,
    pub year: i32,
}

#[derive(Debug, Clone, Copy)]
struct PreparedWrite {
    offset: u32,
    mask: i64,
    value: i64,
}

#[derive(Debug, Clone)]
struct DeviceSettings {
    quirks: Quirks,
    language: String,
    read_policy: ReadPolicy,
    write_policy: WritePolicy,
}

#[derive(Debug)]
pub struct Device {
    info: DeviceEntry,
    id_registers_map: WireId,
    session: Arc<SessionManager>,
    settings: DeviceSettings,
    registers: RwLock<Arc<RegisterMap>>,
    buffer: RwLock<Arc<BufferState>>,
    /// Serializes write jobs of this device.
    write_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl Device {
    pub fn new(
        info: DeviceEntry,
        id_registers_map: WireId,
        session: Arc<SessionManager>,
        cancel: CancellationToken,
    ) -> Self {
        let config = session.config();
        let settings = DeviceSettings {
            quirks: config.quirks(),
            language: config.language.clone(),
            read_policy: config.read_policy(),
            write_policy: config.write_policy(),
        };
        Self {
            info,
            id_registers_map,
            session,
            settings,
            registers: RwLock::default(),
            buffer: RwLock::default(),
            write_lock: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    pub fn info(&self) -> &DeviceEntry {
        &self.info
    }

    pub fn id(&self) -> &WireId {
        &self.info.id
    }

    pub fn id_device(&self) -> &WireId {
        &self.info.id_device
    }

    pub fn id_product(&self) -> &WireId {
        &self.info.id_product
    }

    pub fn product_serial(&self) -> Option<&WireId> {
        self.info.product_serial.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn is_online(&self) -> bool {
        self.info.is_online
    }

    pub fn name_product(&self) -> &str {
        &self.info.name_product
    }

    pub fn id_registers_map(&self) -> &WireId {
        &self.id_registers_map
    }

    fn register_map(&self) -> Arc<RegisterMap> {
        self.registers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn buffer(&self) -> Arc<BufferState> {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_buffer(&self, state: BufferState) {
        *self.buffer.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(state);
    }

    /// Fetches the register schema and keeps this device's map of it.
    pub async fn update_mapping(&self) -> Result<()> {
        let response: RegistersMapResponse = self
            .session
            .call(
                Method::Post,
                api::API_PATH_DEVICE_REGISTERS_MAP,
                &RegistersMapRequest {
                    id_device: self.id_device(),
                    id_product: self.id_product(),
                    last_update: api::REGISTERS_MAP_LAST_UPDATE,
                },
            )
            .await?;
        let map = RegisterMap::from_schema(
            response.device_registers_map.registers_map,
            &self.id_registers_map.to_string(),
        );
        info!(
            "Device '{}' uses register map {} with {} registers",
            self.name(),
            self.id_registers_map,
            map.len()
        );
        *self.registers.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        Ok(())
    }

    /// Reads the device buffer and replaces the current snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn update(&self) -> Result<()> {
        let job: JobRequestResponse = self
            .session
            .call(
                Method::Post,
                api::API_PATH_DEVICE_BUFFER_READING,
                &BufferReadingRequest {
                    id_device: self.id_device(),
                    id_product: self.id_product(),
                    buffer_id: api::BUFFER_ID,
                },
            )
            .await?;
        let answer = self.poll(&job.id_request, true).await?;
        let buffer: BufferAnswer = serde_json::from_value(answer.data).map_err(|err| {
            Error::Protocol(format!(
                "Error in buffer data received from device '{}': {err}",
                self.name()
            ))
        })?;
        let state = BufferState::decode(&buffer.items, &buffer.values)?;
        debug!("Device '{}' buffer holds {} words", self.name(), state.len());
        self.replace_buffer(state);
        Ok(())
    }

    async fn poll(&self, id_request: &WireId, read: bool) -> Result<JobAnswer> {
        let path = format!("{}{id_request}", api::API_PATH_DEVICE_JOB_STATUS);
        let label = format!("{} for device '{}'", self.session.url(&path), self.name());
        let empty = serde_json::Map::new();
        let fetch = || self.session.call::<_, JobAnswer>(Method::Get, &path, &empty);
        if read {
            job::poll_read(&label, &self.settings.read_policy, &self.cancel, fetch).await
        } else {
            job::poll_write(&label, &self.settings.write_policy, &self.cancel, fetch).await
        }
    }

    /// Known register keys, lowercased and sorted.
    pub fn registers(&self) -> Vec<String> {
        self.register_map().keys().map(str::to_string).collect()
    }

    pub fn has_register(&self, key: &str) -> bool {
        self.register_map().contains(key)
    }

    pub fn register_descriptor(&self, key: &str) -> Option<RegisterDescriptor> {
        self.register_map()
            .get(key)
            .map(|register| register.descriptor().clone())
    }

    /// The register with its current value.
    ///
    /// `None` when the key is unknown, the buffer has no word at its offset or
    /// its formula fails. Such a register is merely not available right now.
    pub fn get_register(&self, key: &str) -> Option<RegisterReading> {
        let map = self.register_map();
        let register = map.get(key)?;
        let descriptor = register.descriptor();
        let value_raw = self.buffer().raw(descriptor.offset, descriptor.mask)?;
        match register.decode(value_raw) {
            Ok(value) => Some(RegisterReading {
                descriptor: descriptor.clone(),
                value_raw,
                value,
            }),
            Err(err) => {
                debug!("Cannot decode register '{key}': {err}");
                None
            }
        }
    }

    /// Current display value, with the enabled reading quirks applied.
    pub fn get_register_value(&self, key: &str) -> Option<Number> {
        let reading = self.get_register(key)?;
        self.settings
            .quirks
            .filter(key, reading.value_raw, reading.value)
    }

    pub fn get_register_value_min(&self, key: &str) -> Option<Number> {
        self.get_register(key)?.descriptor.set_min
    }

    pub fn get_register_value_max(&self, key: &str) -> Option<Number> {
        self.get_register(key)?.descriptor.set_max
    }

    /// Current value rendered with the register's `format_string`.
    pub fn get_register_value_formatted(&self, key: &str) -> Option<String> {
        let reading = self.get_register(key)?;
        Some(match &reading.descriptor.format_string {
            Some(template) => format_value(template, reading.value),
            None => reading.value.to_string(),
        })
    }

    /// Current value as its localized label, or the bare value without one.
    pub fn get_register_value_description(
        &self,
        key: &str,
        language: Option<&str>,
    ) -> Option<ValueDescription> {
        let value = self.get_register_value(key)?;
        Some(
            self.get_register_value_options(key, language)
                .into_iter()
                .find(|(option, _)| *option == value)
                .map_or(ValueDescription::Value(value), |(_, label)| {
                    ValueDescription::Label(label)
                }),
        )
    }

    /// `enc_val` entries of `key` in `language`, or the configured language.
    ///
    /// Falls back to [`DEFAULT_LANGUAGE`] when the register has no entries in
    /// that language. Empty for registers that are not enumerated.
    pub fn get_register_value_options(
        &self,
        key: &str,
        language: Option<&str>,
    ) -> Vec<(Number, String)> {
        let map = self.register_map();
        let Some(options) = map
            .get(key)
            .and_then(|register| register.descriptor().enc_val.as_ref())
        else {
            return Vec::new();
        };
        let wanted = language.unwrap_or(&self.settings.language);
        let language = if options.iter().any(|option| option.lang == wanted) {
            wanted
        } else {
            DEFAULT_LANGUAGE
        };
        options
            .iter()
            .filter(|option| option.lang == language)
            .map(|option| (option.value, option.description.clone()))
            .collect()
    }

    pub fn get_register_value_options_languages(&self, key: &str) -> BTreeSet<String> {
        self.register_map()
            .get(key)
            .and_then(|register| register.descriptor().enc_val.as_ref())
            .map(|options| options.iter().map(|option| option.lang.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether the gate register of `key` currently enables it.
    pub fn get_register_enabled(&self, key: &str) -> Result<bool> {
        self.register_map()
            .is_enabled(key, |gate| self.get_register_value(gate))
    }

    /// Validates `value` and converts it to the raw value to write.
    ///
    /// Bounds apply to `value` itself, or with `limit_raw` to the converted raw value.
    fn prepare(&self, key: &str, value: Number, limit_raw: bool) -> Result<PreparedWrite> {
        let map = self.register_map();
        let register = map.get(key).ok_or_else(|| {
            Error::Validation(format!(
                "Unknown register '{key}' on device '{}'",
                self.name()
            ))
        })?;
        let descriptor = register.descriptor();
        if !value.as_f64().is_finite() {
            return Err(Error::Validation(format!(
                "Value for '{key}' must be finite: {value}"
            )));
        }
        if !limit_raw {
            check_bounds(key, "Value", value, descriptor)?;
        }
        let mut raw = register.encode(value)?;
        if limit_raw {
            check_bounds(key, "Raw value", Number::Int(raw), descriptor)?;
        }
        if descriptor.is_hex {
            raw = hex_literal(key, raw)?;
        }
        Ok(PreparedWrite {
            offset: descriptor.offset,
            mask: descriptor.mask,
            value: raw,
        })
    }

    /// Submits one write job for `writes` and waits for it to complete.
    async fn request_writing(&self, writes: &[PreparedWrite]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let request = WriteRequest {
            id_device: self.id_device(),
            id_product: self.id_product(),
            protocol: api::WRITE_PROTOCOL,
            bit_data: vec![api::WRITE_BIT_DATA; writes.len()],
            endianess: vec![api::WRITE_ENDIANESS; writes.len()],
            items: writes.iter().map(|w| w.offset).collect(),
            masks: writes.iter().map(|w| w.mask).collect(),
            values: writes.iter().map(|w| w.value).collect(),
        };
        let job: JobRequestResponse = self
            .session
            .call(Method::Post, api::API_PATH_DEVICE_WRITING, &request)
            .await?;
        self.poll(&job.id_request, false).await?;
        self.merge_written(writes);
        Ok(())
    }

    /// Applies `writes` to the current snapshot under a single write guard.
    fn merge_written(&self, writes: &[PreparedWrite]) {
        let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
        let merged = writes.iter().fold((**buffer).clone(), |state, w| {
            state.with_written(w.offset, w.mask, w.value)
        });
        *buffer = Arc::new(merged);
    }

    /// Writes one register.
    ///
    /// Fails with [`Error::Validation`] before anything is sent when `value` is
    /// out of bounds, and with [`Error::Protocol`] when the write job fails.
    pub async fn set_register_value(
        &self,
        key: &str,
        value: Number,
        limit_raw: bool,
    ) -> Result<()> {
        let write = self.prepare(key, value, limit_raw)?;
        self.request_writing(&[write]).await.map_err(|err| {
            error!("Error while trying to set '{key}' to {value}: {err}");
            err
        })
    }

    /// Writes several registers with a single job.
    ///
    /// Every value is validated first; one invalid value aborts the whole batch.
    pub async fn set_register_values<K: AsRef<str>>(
        &self,
        values: &[(K, Number)],
        limit_raw: bool,
    ) -> Result<()> {
        let writes = values
            .iter()
            .map(|(key, value)| self.prepare(key.as_ref(), *value, limit_raw))
            .collect::<Result<Vec<_>>>()?;
        if writes.is_empty() {
            return Ok(());
        }
        self.request_writing(&writes).await.map_err(|err| {
            let keys: Vec<&str> = values.iter().map(|(key, _)| key.as_ref()).collect();
            error!("Error while trying to set {keys:?}: {err}");
            err
        })
    }

    /// Writes the value whose label is `description`.
    ///
    /// A label that is not among the options is parsed as a number, and if
    /// that fails `fallback` is written instead.
    pub async fn set_register_value_description(
        &self,
        key: &str,
        description: &str,
        fallback: Option<Number>,
        language: Option<&str>,
    ) -> Result<()> {
        let value = self
            .get_register_value_options(key, language)
            .into_iter()
            .find(|(_, label)| label == description)
            .map(|(value, _)| value)
            .or_else(|| description.parse().ok())
            .or(fallback)
            .ok_or_else(|| {
                Error::Validation(format!("'{description}' is not a valid value for '{key}'"))
            })?;
        self.set_register_value(key, value, false).await
    }

    /// Whether the stove burns wood as well as pellets.
    pub fn hybrid(&self) -> bool {
        self.has_register(HYBRID_REGISTER)
    }

    /// Sets the stove clock and calendar.
    pub async fn sync_clock(&self, now: ClockTime) -> Result<()> {
        self.set_register_values(
            &[
                ("clock_hour_set", Number::Int(now.hour.into())),
                ("clock_minute_set", Number::Int(now.minute.into())),
                ("calendar_day_set", Number::Int(now.day.into())),
                ("calendar_month_set", Number::Int(now.month.into())),
                ("calendar_year_set", Number::Int(now.year.into())),
            ],
            true,
        )
        .await
    }

    /// Every register with its current reading, `None` where unavailable.
    pub fn diagnostics(&self) -> BTreeMap<String, Option<RegisterReading>> {
        self.registers()
            .into_iter()
            .map(|key| {
                let reading = self.get_register(&key);
                (key, reading)
            })
            .collect()
    }

    /// First `temp_<variant>_<suffix>` register that is enabled and has a value.
    fn temperature_key(&self, variants: &[&str], suffix: &str) -> Option<String> {
        variants
            .iter()
            .map(|variant| format!("temp_{variant}_{suffix}"))
            .find(|key| {
                self.has_register(key)
                    && self.get_register_enabled(key).unwrap_or(false)
                    && self.get_register_value(key).is_some()
            })
    }

    pub fn air_temperature(&self) -> Option<Number> {
        let key = self.temperature_key(&AIR_VARIANTS, "get")?;
        self.get_register_value(&key)
    }

    pub fn set_air_temperature(&self) -> Option<Number> {
        let key = self.temperature_key(&AIR_VARIANTS, "set")?;
        self.get_register_value(&key)
    }

    pub fn water_temperature(&self) -> Option<Number> {
        let key = self.temperature_key(&WATER_VARIANTS, "get")?;
        self.get_register_value(&key)
    }

    pub fn set_water_temperature(&self) -> Option<Number> {
        let key = self.temperature_key(&WATER_VARIANTS, "set")?;
        self.get_register_value(&key)
    }

    /// Writes the target air temperature to the first available air variant.
    pub async fn set_target_air_temperature(&self, value: Number) -> Result<()> {
        let key = self.temperature_key(&AIR_VARIANTS, "set").ok_or_else(|| {
            Error::Validation(format!(
                "Device '{}' has no air temperature setpoint",
                self.name()
            ))
        })?;
        self.set_register_value(&key, value, false).await
    }

    /// Step of the air temperature setpoint, 1 when the map does not say.
    pub fn target_temperature_step(&self) -> Option<Number> {
        let key = self.temperature_key(&AIR_VARIANTS, "set")?;
        self.register_descriptor(&key).map(|descriptor| descriptor.step)
    }

    /// Wood while a hybrid stove reports its wood power as enabled.
    pub fn hybrid_mode(&self) -> HybridMode {
        if self.hybrid() && self.get_register_enabled(WOOD_ACTIVE_REGISTER).unwrap_or(false) {
            HybridMode::Wood
        } else {
            HybridMode::Pellet
        }
    }

    /// Power register of the fuel currently burning.
    pub fn power_key(&self) -> &'static str {
        match self.hybrid_mode() {
            HybridMode::Wood => WOOD_POWER_REGISTER,
            HybridMode::Pellet => POWER_REGISTER,
        }
    }

    pub fn power(&self) -> Option<Number> {
        self.get_register_value(self.power_key())
    }

    pub async fn set_power(&self, value: Number) -> Result<()> {
        self.set_register_value(self.power_key(), value, false).await
    }

    pub fn status(&self) -> Option<ValueDescription> {
        self.get_register_value_description("status_get", None)
    }

    /// Whether `status_get` reports a stove that is off or shutting down.
    pub fn is_off(&self) -> bool {
        if self.get_register_value("status_get") == Some(Number::Int(0)) {
            return true;
        }
        self.status().is_some_and(|status| {
            let status = status.to_string().to_uppercase();
            STATUS_OFF.contains(&status.as_str())
        })
    }

    pub async fn turn_on(&self) -> Result<()> {
        self.set_register_value_description(STATUS_MANAGED_REGISTER, "ON", None, None)
            .await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.set_register_value_description(STATUS_MANAGED_REGISTER, "OFF", None, None)
            .await
    }
}

fn check_bounds(
    key: &str,
    what: &str,
    value: Number,
    descriptor: &RegisterDescriptor,
) -> Result<()> {
    let below = descriptor.set_min.is_some_and(|min| value < min);
    let above = descriptor.set_max.is_some_and(|max| value > max);
    if below || above {
        let bound = |b: Option<Number>| b.map_or_else(|| "-".to_string(), |b| b.to_string());
        return Err(Error::Validation(format!(
            "{what} for '{key}' must be between {} and {}: {value}",
            bound(descriptor.set_min),
            bound(descriptor.set_max)
        )));
    }
    Ok(())
}

/// Reads the decimal digits of `raw` as a hexadecimal literal, `12` becomes `0x12`.
fn hex_literal(key: &str, raw: i64) -> Result<i64> {
    if raw < 0 {
        return Err(Error::Validation(format!(
            "Raw value for hex register '{key}' must not be negative: {raw}"
        )));
    }
    i64::from_str_radix(&raw.to_string(), 16).map_err(|err| {
        Error::Validation(format!("Raw value {raw} for '{key}' overflows as hex: {err}"))
    })
}

/// Renders `value` into the first `{}` style placeholder of `template`.
///
/// Understands `{}`, `{:d}` and `{:.Nf}`; other specs render the plain value.
fn format_value(template: &str, value: Number) -> String {
    let Some(start) = template.find('{') else {
        return template.to_string();
    };
    let Some(len) = template[start..].find('}') else {
        return template.to_string();
    };
    let spec = &template[start + 1..start + len];
    let spec = spec.split_once(':').map_or("", |(_, spec)| spec);
    let rendered = if let Some(precision) = spec
        .strip_prefix('.')
        .and_then(|rest| rest.strip_suffix('f'))
        .and_then(|digits| digits.parse::<usize>().ok())
    {
        format!("{:.precision$}", value.as_f64())
    } else if spec == "d" {
        value
            .trunc()
            .map_or_else(|_| value.to_string(), |v| v.to_string())
    } else {
        value.to_string()
    };
    format!(
        "{}{rendered}{}",
        &template[..start],
        &template[start + len + 1..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::tests::descriptor;
    use crate::register::{EncodedValue, EnableValue, REG_TYPE_ENABLE};
    use crate::session::tests::{login_ok, manager, Replay};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn entry() -> DeviceEntry {
        serde_json::from_value(json!({
            "id": 1, "id_device": "D1", "id_product": "P1", "product_serial": "S1",
            "name": "Living room", "is_online": true, "name_product": "Pellet 9"
        }))
        .unwrap()
    }

    fn encoded(value: i64, description: &str, lang: &str) -> EncodedValue {
        EncodedValue {
            value: Number::Int(value),
            description: description.to_string(),
            lang: lang.to_string(),
        }
    }

    fn device_with(
        replay: Arc<Replay>,
        descriptors: Vec<RegisterDescriptor>,
        items: &[u32],
        values: &[i64],
    ) -> Device {
        let device = Device::new(
            entry(),
            WireId::new(7),
            Arc::new(manager(replay, 1_000)),
            CancellationToken::new(),
        );
        *device.registers.write().unwrap() =
            Arc::new(RegisterMap::from_descriptors(descriptors));
        device.replace_buffer(BufferState::decode(items, values).unwrap());
        device
    }

    fn stove() -> Device {
        let mut power = descriptor("power_set", 5);
        power.mask = 0xFF;
        power.set_min = Some(Number::Int(1));
        power.set_max = Some(Number::Int(5));
        power.enc_val = Some(vec![
            encoded(1, "P1", "ENG"),
            encoded(2, "P2", "ENG"),
            encoded(1, "Potenza 1", "ITA"),
        ]);

        let mut temp = descriptor("temp_air_get", 1);
        temp.formula = "# / 2".into();
        temp.formula_inverse = "# * 2".into();
        temp.format_string = Some("{:.1f} °C".into());

        let mut setpoint = descriptor("temp_air_set", 2);
        setpoint.formula = "# / 2".into();
        setpoint.formula_inverse = "# * 2".into();
        setpoint.set_min = Some(Number::Int(7));
        setpoint.set_max = Some(Number::Int(30));

        let mut gate = descriptor("temp_air_enable", 3);
        gate.reg_type = Some(REG_TYPE_ENABLE.into());
        gate.enable_val = Some(vec![EnableValue {
            value: Number::Int(1),
            description: None,
        }]);

        let mut status = descriptor("status_get", 4);
        status.enc_val = Some(vec![encoded(0, "OFF", "ENG"), encoded(3, "WORK", "ENG")]);

        let mut hour = descriptor("clock_hour_set", 10);
        hour.set_min = Some(Number::Int(0));
        hour.set_max = Some(Number::Int(23));
        let mut code = descriptor("code_set", 11);
        code.is_hex = true;
        code.set_max = Some(Number::Int(9999));

        device_with(
            Replay::new(vec![]),
            vec![power, temp, setpoint, gate, status, hour, code],
            &[5, 1, 2, 3, 4, 10, 11],
            &[0x0103, 43, 42, 1, 3, 12, 0],
        )
    }

    #[test]
    fn readings() {
        let device = stove();
        assert_eq!(device.get_register_value("power_set"), Some(Number::Int(3)));
        assert_eq!(device.get_register_value("POWER_SET"), Some(Number::Int(3)));
        assert_eq!(device.get_register_value("temp_air_get"), Some(Number::Float(21.5)));
        assert_eq!(device.get_register_value("missing"), None);
        let reading = device.get_register("power_set").unwrap();
        assert_eq!(reading.value_raw, 3);
        assert_eq!(device.get_register_value_min("power_set"), Some(Number::Int(1)));
        assert_eq!(device.get_register_value_max("power_set"), Some(Number::Int(5)));
        assert_eq!(
            device.get_register_value_formatted("temp_air_get").as_deref(),
            Some("21.5 °C")
        );
        assert_eq!(device.get_register_value_formatted("power_set").as_deref(), Some("3"));
    }

    #[test]
    fn unavailable_without_buffer_word() {
        let device = device_with(
            Replay::new(vec![]),
            vec![descriptor("power_set", 5)],
            &[6],
            &[1],
        );
        assert!(device.has_register("power_set"));
        assert_eq!(device.get_register("power_set"), None);
    }

    #[test]
    fn options_and_descriptions() {
        let device = stove();
        assert_eq!(
            device.get_register_value_options("power_set", Some("ITA")),
            vec![(Number::Int(1), "Potenza 1".to_string())]
        );
        assert_eq!(
            device.get_register_value_options("power_set", Some("FRA")),
            vec![
                (Number::Int(1), "P1".to_string()),
                (Number::Int(2), "P2".to_string())
            ]
        );
        assert_eq!(
            device.get_register_value_options_languages("power_set"),
            BTreeSet::from(["ENG".to_string(), "ITA".to_string()])
        );
        assert!(device.get_register_value_options("temp_air_get", None).is_empty());
        assert_eq!(
            device.get_register_value_description("power_set", None),
            Some(ValueDescription::Value(Number::Int(3)))
        );
        assert_eq!(
            device.status(),
            Some(ValueDescription::Label("WORK".to_string()))
        );
        assert_eq!(device.status().unwrap().to_string(), "WORK");
    }

    #[test]
    fn gates_and_projections() {
        let device = stove();
        assert!(device.get_register_enabled("temp_air_get").unwrap());
        assert!(device.get_register_enabled("power_set").unwrap());
        assert_eq!(device.air_temperature(), Some(Number::Float(21.5)));
        assert_eq!(device.set_air_temperature(), Some(Number::Float(21.0)));
        assert_eq!(device.water_temperature(), None);
        assert_eq!(device.power(), Some(Number::Int(3)));
        assert!(!device.hybrid());
        assert_eq!(device.hybrid_mode(), HybridMode::Pellet);
        assert_eq!(device.target_temperature_step(), Some(Number::Int(1)));
        assert!(!device.is_off());
    }

    fn hybrid_stove(replay: Arc<Replay>, burning_wood: i64) -> Device {
        let mut gate = descriptor("real_power_wood_enable", 8);
        gate.reg_type = Some(REG_TYPE_ENABLE.into());
        gate.enable_val = Some(vec![EnableValue {
            value: Number::Int(1),
            description: None,
        }]);
        device_with(
            replay,
            vec![
                descriptor("power_set", 5),
                descriptor("power_wood_set", 6),
                descriptor("real_power_wood_get", 7),
                gate,
            ],
            &[5, 6, 7, 8],
            &[3, 2, 4, burning_wood],
        )
    }

    #[test]
    fn power_follows_burning_fuel() {
        let wood = hybrid_stove(Replay::new(vec![]), 1);
        assert!(wood.hybrid());
        assert_eq!(wood.hybrid_mode(), HybridMode::Wood);
        assert_eq!(wood.hybrid_mode().to_string(), "Wood");
        assert_eq!(wood.power_key(), "power_wood_set");
        assert_eq!(wood.power(), Some(Number::Int(2)));

        let pellet = hybrid_stove(Replay::new(vec![]), 0);
        assert_eq!(pellet.hybrid_mode(), HybridMode::Pellet);
        assert_eq!(pellet.power_key(), "power_set");
        assert_eq!(pellet.power(), Some(Number::Int(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn set_power_writes_wood_register() {
        let replay = Replay::new(vec![
            login_ok(5_000),
            (200, json!({"idRequest": "p1"})),
            (200, json!({"jobAnswerStatus": "completed", "jobAnswerData": {"Cmd": 1}})),
        ]);
        let device = hybrid_stove(replay.clone(), 1);
        device.set_power(Number::Int(4)).await.unwrap();
        let body = replay.request(1).body.unwrap();
        assert_eq!(body["Items"], json!([6]));
        assert_eq!(body["Values"], json!([4]));
        assert_eq!(device.power(), Some(Number::Int(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn turn_on_and_off_by_label() {
        let replay = Replay::new(vec![
            login_ok(5_000),
            (200, json!({"idRequest": "off"})),
            (200, json!({"jobAnswerStatus": "completed", "jobAnswerData": {"Cmd": 1}})),
            (200, json!({"idRequest": "on"})),
            (200, json!({"jobAnswerStatus": "completed", "jobAnswerData": {"Cmd": 1}})),
        ]);
        let mut managed = descriptor("status_managed_get", 9);
        managed.enc_val = Some(vec![encoded(0, "OFF", "ENG"), encoded(1, "ON", "ENG")]);
        let device = device_with(replay.clone(), vec![managed], &[9], &[1]);

        device.turn_off().await.unwrap();
        assert_eq!(replay.request(1).body.unwrap()["Values"], json!([0]));
        device.turn_on().await.unwrap();
        assert_eq!(replay.request(3).body.unwrap()["Values"], json!([1]));
        assert!(replay.request(4).url.ends_with("/deviceJobStatus/on"));
    }

    #[test]
    fn off_states() {
        let mut status = descriptor("status_get", 4);
        status.enc_val = Some(vec![
            encoded(0, "OFF", "ENG"),
            encoded(3, "WORK", "ENG"),
            encoded(5, "Final cleaning", "ENG"),
        ]);
        let off = |raw: i64| {
            device_with(Replay::new(vec![]), vec![status.clone()], &[4], &[raw]).is_off()
        };
        assert!(off(0));
        assert!(!off(3));
        assert!(off(5));
        assert!(off(6));
    }

    #[test]
    fn setpoint_step() {
        let mut setpoint = descriptor("temp_air_set", 2);
        setpoint.step = Number::Float(0.5);
        let device = device_with(Replay::new(vec![]), vec![setpoint], &[2], &[20]);
        assert_eq!(device.target_temperature_step(), Some(Number::Float(0.5)));

        let device = device_with(Replay::new(vec![]), vec![], &[2], &[20]);
        assert_eq!(device.target_temperature_step(), None);
    }

    #[test]
    fn written_bits_merge_into_latest_snapshot() {
        let device = device_with(
            Replay::new(vec![]),
            vec![descriptor("power_set", 5)],
            &[5, 6],
            &[0x0103, 1],
        );
        // A read landed while the write job was polled.
        device.replace_buffer(BufferState::decode(&[5, 6], &[0x0203, 9]).unwrap());
        device.merge_written(&[PreparedWrite {
            offset: 5,
            mask: 0xFF,
            value: 4,
        }]);
        assert_eq!(device.buffer().raw(5, 0xFFFF), Some(0x0204));
        assert_eq!(device.buffer().raw(6, 0xFFFF), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn job_errors_name_status_url_and_device() {
        let replay = Replay::new(vec![
            login_ok(5_000),
            (200, json!({"idRequest": "r7"})),
            (200, json!({"jobAnswerStatus": "terminated"})),
            (200, json!({"idRequest": "w7"})),
            (200, json!({"jobAnswerStatus": "completed", "jobAnswerData": {}})),
        ]);
        let device = device_with(replay, vec![descriptor("power_set", 5)], &[5], &[1]);

        let err = device.update().await.unwrap_err();
        assert_matches!(
            err,
            Error::Protocol(msg)
                if msg.contains("https://micronova.agua-iot.com/deviceJobStatus/r7")
                    && msg.contains("'Living room'")
        );
        let err = device
            .set_register_value("power_set", Number::Int(2), false)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::Protocol(msg) if msg.contains("/deviceJobStatus/w7") && msg.contains("'Living room'")
        );
    }

    #[test]
    fn prepare_checks_bounds() {
        let device = stove();
        assert_matches!(
            device.prepare("power_set", Number::Int(6), false),
            Err(Error::Validation(..))
        );
        assert_matches!(
            device.prepare("power_set", Number::Float(f64::NAN), false),
            Err(Error::Validation(..))
        );
        assert_matches!(
            device.prepare("nothing_set", Number::Int(1), false),
            Err(Error::Validation(..))
        );
        let write = device.prepare("temp_air_set", Number::Float(21.5), false).unwrap();
        assert_eq!((write.offset, write.value), (2, 43));
        // 43 is outside 7..=30 once bounds apply to the raw value.
        assert_matches!(
            device.prepare("temp_air_set", Number::Float(21.5), true),
            Err(Error::Validation(..))
        );
    }

    #[test]
    fn prepare_hex() {
        let device = stove();
        assert_eq!(device.prepare("code_set", Number::Int(1234), false).unwrap().value, 0x1234);
        assert_matches!(hex_literal("code_set", -1), Err(Error::Validation(..)));
    }

    #[test]
    fn formats() {
        assert_eq!(format_value("{}", Number::Int(3)), "3");
        assert_eq!(format_value("{:.2f}", Number::Float(21.456)), "21.46");
        assert_eq!(format_value("{:d} rpm", Number::Float(1200.7)), "1200 rpm");
        assert_eq!(format_value("T: {:.1f}°", Number::Int(20)), "T: 20.0°");
        assert_eq!(format_value("plain", Number::Int(1)), "plain");
    }

    #[tokio::test(start_paused = true)]
    async fn write_job_updates_snapshot() {
        let replay = Replay::new(vec![
            login_ok(5_000),
            (200, json!({"idRequest": "w1"})),
            (200, json!({"jobAnswerStatus": "completed", "jobAnswerData": {"Cmd": "OK"}})),
        ]);
        let mut power = descriptor("power_set", 5);
        power.mask = 0xFF;
        let device = device_with(replay.clone(), vec![power], &[5], &[0x0103]);
        device
            .set_register_value("power_set", Number::Int(4), false)
            .await
            .unwrap();

        let write = replay.request(1);
        assert!(write.url.ends_with("/deviceRequestWriting"));
        assert_eq!(
            write.body.unwrap(),
            json!({
                "id_device": "D1", "id_product": "P1", "Protocol": "RWMSmaster",
                "BitData": [8], "Endianess": ["L"], "Items": [5], "Masks": [255], "Values": [4]
            })
        );
        assert!(replay.request(2).url.ends_with("/deviceJobStatus/w1"));
        assert_eq!(device.get_register_value("power_set"), Some(Number::Int(4)));
        assert_eq!(device.buffer().raw(5, 0xFFFF), Some(0x0104));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_validated_before_sending() {
        let replay = Replay::new(vec![]);
        let device = device_with(
            replay.clone(),
            vec![descriptor("clock_hour_set", 1), descriptor("clock_minute_set", 2)],
            &[1, 2],
            &[0, 0],
        );
        let result = device
            .set_register_values(
                &[
                    ("clock_hour_set", Number::Int(10)),
                    ("clock_minute_set", Number::Int(500)),
                ],
                false,
            )
            .await;
        assert_matches!(result, Err(Error::Validation(..)));
        assert!(replay.urls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn description_resolution() {
        let replay = Replay::new(vec![
            login_ok(5_000),
            (200, json!({"idRequest": 9})),
            (200, json!({"jobAnswerStatus": "completed", "jobAnswerData": {"Cmd": 1}})),
        ]);
        let mut power = descriptor("power_set", 5);
        power.enc_val = Some(vec![encoded(2, "P2", "ENG")]);
        let device = device_with(replay.clone(), vec![power], &[5], &[1]);
        device
            .set_register_value_description("power_set", "P2", None, None)
            .await
            .unwrap();
        assert_eq!(replay.request(1).body.unwrap()["Values"], json!([2]));
        assert!(replay.request(2).url.ends_with("/deviceJobStatus/9"));

        assert_matches!(
            device
                .set_register_value_description("power_set", "turbo", None, None)
                .await,
            Err(Error::Validation(..))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn update_replaces_buffer() {
        let replay = Replay::new(vec![
            login_ok(5_000),
            (200, json!({"idRequest": "r1"})),
            (200, json!({"jobAnswerStatus": "waiting"})),
            (
                200,
                json!({"jobAnswerStatus": "completed", "jobAnswerData": {"Items": [5], "Values": [2]}}),
            ),
        ]);
        let device = device_with(replay.clone(), vec![descriptor("power_set", 5)], &[5, 6], &[1, 1]);
        device.update().await.unwrap();
        assert_eq!(device.get_register_value("power_set"), Some(Number::Int(2)));
        assert_eq!(device.buffer().len(), 1);
        assert_eq!(
            replay.request(1).body.unwrap(),
            json!({"id_device": "D1", "id_product": "P1", "BufferId": 1})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_keeps_buffer() {
        let replay = Replay::new(vec![
            login_ok(5_000),
            (200, json!({"idRequest": "r1"})),
            (
                200,
                json!({"jobAnswerStatus": "completed", "jobAnswerData": {"Items": [5, 6], "Values": [2]}}),
            ),
        ]);
        let device = device_with(replay, vec![descriptor("power_set", 5)], &[5], &[1]);
        assert_matches!(device.update().await, Err(Error::Protocol(..)));
        assert_eq!(device.get_register_value("power_set"), Some(Number::Int(1)));
    }

    #[tokio::test]
    async fn update_mapping_selects_map() {
        let replay = Replay::new(vec![
            login_ok(5_000),
            (
                200,
                json!({"device_registers_map": {"registers_map": [
                    {"id": 7, "registers": [{"reg_key": "power_set", "offset": 5, "mask": 255}]},
                    {"id": 8, "registers": [{"reg_key": "other_set", "offset": 1, "mask": 255}]}
                ]}}),
            ),
        ]);
        let device = device_with(replay.clone(), vec![], &[5], &[1]);
        device.update_mapping().await.unwrap();
        assert_eq!(device.registers(), vec!["power_set".to_string()]);
        assert_eq!(
            replay.request(1).body.unwrap()["last_update"],
            json!("2018-06-03T08:59:54.043")
        );
        assert!(device.diagnostics()["power_set"].is_some());
    }
}
