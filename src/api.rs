//! Wire format of the Agua IOT REST API.
//!
//! Paths are relative to the installation's base URL. All bodies are JSON.

use crate::register::RegistersMapEntry;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub const API_PATH_APP_SIGNUP: &str = "/appSignup";
pub const API_PATH_LOGIN: &str = "/userLogin";
pub const API_PATH_REFRESH_TOKEN: &str = "/refreshToken";
pub const API_PATH_DEVICE_LIST: &str = "/deviceList";
pub const API_PATH_DEVICE_INFO: &str = "/deviceGetInfo";
pub const API_PATH_DEVICE_REGISTERS_MAP: &str = "/deviceGetRegistersMap";
pub const API_PATH_DEVICE_BUFFER_READING: &str = "/deviceGetBufferReading";
pub const API_PATH_DEVICE_JOB_STATUS: &str = "/deviceJobStatus/";
pub const API_PATH_DEVICE_WRITING: &str = "/deviceRequestWriting";

pub const HEADER_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";
pub const HEADER_CONTENT_TYPE: &str = "application/json";
pub const HEADER_ORIGIN: &str = "file://";
pub const DEFAULT_BRAND_ID: &str = "1";

/// `last_update` the registers map request is sent with, so the full schema comes back.
pub const REGISTERS_MAP_LAST_UPDATE: &str = "2018-06-03T08:59:54.043";
/// Buffer holding the device's live values.
pub const BUFFER_ID: u32 = 1;
pub const WRITE_PROTOCOL: &str = "RWMSmaster";
pub const WRITE_BIT_DATA: u32 = 8;
pub const WRITE_ENDIANESS: &str = "L";

/// An identifier as the cloud sent it, either a JSON string or number.
///
/// Kept verbatim so it is echoed back in the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireId(serde_json::Value);

impl WireId {
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self(value.into())
    }

    /// Compares by textual form, so `7` matches `"7"`.
    pub fn matches(&self, other: &str) -> bool {
        self.to_string() == other
    }
}

impl fmt::Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

/// Accepts `true`/`false` as well as `0`/`1`, `null` as `false`.
pub(crate) fn bool_or_int<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Int(i)) => i != 0,
        None => false,
    })
}

#[derive(Debug, Serialize)]
pub struct AppSignupRequest<'a> {
    pub phone_type: &'a str,
    pub phone_id: &'a str,
    pub phone_version: &'a str,
    pub language: &'a str,
    pub id_app: &'a str,
    pub push_notification_token: &'a str,
    pub push_notification_active: bool,
}

impl<'a> AppSignupRequest<'a> {
    pub fn new(unique_id: &'a str) -> Self {
        Self {
            phone_type: "Android",
            phone_id: unique_id,
            phone_version: "1.0",
            language: "en",
            id_app: unique_id,
            push_notification_token: unique_id,
            push_notification_active: false,
        }
    }
}

#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub token: String,
}

/// Identity of a device as listed by `/deviceList`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: WireId,
    pub id_device: WireId,
    pub id_product: WireId,
    #[serde(default)]
    pub product_serial: Option<WireId>,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub is_online: bool,
    #[serde(default)]
    pub name_product: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(default)]
    pub device: Vec<DeviceEntry>,
}

#[derive(Debug, Serialize)]
pub struct DeviceRequest<'a> {
    pub id_device: &'a WireId,
    pub id_product: &'a WireId,
}

#[derive(Debug, Deserialize)]
pub struct DeviceInfoEntry {
    pub id_registers_map: WireId,
}

#[derive(Debug, Deserialize)]
pub struct DeviceInfoResponse {
    #[serde(default)]
    pub device_info: Vec<DeviceInfoEntry>,
}

#[derive(Debug, Serialize)]
pub struct RegistersMapRequest<'a> {
    pub id_device: &'a WireId,
    pub id_product: &'a WireId,
    pub last_update: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct RegistersMapBody {
    #[serde(default)]
    pub registers_map: Vec<RegistersMapEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RegistersMapResponse {
    pub device_registers_map: RegistersMapBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BufferReadingRequest<'a> {
    #[serde(rename = "id_device")]
    pub id_device: &'a WireId,
    #[serde(rename = "id_product")]
    pub id_product: &'a WireId,
    pub buffer_id: u32,
}

/// Answer of a job submission, both reads and writes.
#[derive(Debug, Deserialize)]
pub struct JobRequestResponse {
    #[serde(rename = "idRequest")]
    pub id_request: WireId,
}

/// `jobAnswerData` of a finished buffer read.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BufferAnswer {
    pub items: Vec<u32>,
    pub values: Vec<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WriteRequest<'a> {
    #[serde(rename = "id_device")]
    pub id_device: &'a WireId,
    #[serde(rename = "id_product")]
    pub id_product: &'a WireId,
    pub protocol: &'a str,
    pub bit_data: Vec<u32>,
    pub endianess: Vec<&'a str>,
    pub items: Vec<u32>,
    pub masks: Vec<i64>,
    pub values: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_ids_keep_their_shape() {
        let entry: DeviceEntry = serde_json::from_value(json!({
            "id": 1, "id_device": "ABC123", "id_product": 42,
            "product_serial": "S-1", "name": "Stove", "is_online": 1,
            "name_product": "Pellet 9"
        }))
        .unwrap();
        assert_eq!(entry.id_device.to_string(), "ABC123");
        assert!(entry.id_product.matches("42"));
        assert!(entry.is_online);

        let body = serde_json::to_value(DeviceRequest {
            id_device: &entry.id_device,
            id_product: &entry.id_product,
        })
        .unwrap();
        assert_eq!(body, json!({"id_device": "ABC123", "id_product": 42}));
    }

    #[test]
    fn write_request_field_names() {
        let id = WireId::new("D1");
        let product = WireId::new(3);
        let body = serde_json::to_value(WriteRequest {
            id_device: &id,
            id_product: &product,
            protocol: WRITE_PROTOCOL,
            bit_data: vec![WRITE_BIT_DATA],
            endianess: vec![WRITE_ENDIANESS],
            items: vec![5],
            masks: vec![255],
            values: vec![4],
        })
        .unwrap();
        assert_eq!(
            body,
            json!({
                "id_device": "D1", "id_product": 3, "Protocol": "RWMSmaster",
                "BitData": [8], "Endianess": ["L"], "Items": [5], "Masks": [255], "Values": [4]
            })
        );
    }

    #[test]
    fn buffer_reading_request_field_names() {
        let id = WireId::new("D1");
        let product = WireId::new(3);
        let body = serde_json::to_value(BufferReadingRequest {
            id_device: &id,
            id_product: &product,
            buffer_id: BUFFER_ID,
        })
        .unwrap();
        assert_eq!(body, json!({"id_device": "D1", "id_product": 3, "BufferId": 1}));
    }
}
